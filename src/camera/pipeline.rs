//! Preview frame pipeline.
//!
//! Turns the continuous raw frame stream into compact upright JPEGs for the
//! transport, with latest-frame-wins backpressure at both ends: the raw slot
//! and the output slot each hold only the newest value, so a slow consumer
//! costs dropped frames, never growing latency or memory.
//!
//! Per frame: native pixels → RGB, JPEG at a moderate quality, 4× downscale,
//! rotate upright, re-encode at the transfer quality. A failure anywhere
//! yields "no frame this cycle" and the stream carries on.

use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ImageBuffer, ImageFormat, RgbImage};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{PixelFormat, RawFrame};
use crate::protocol::now_millis;

/// Quality for the first, full-size compression pass
pub const CAPTURE_JPEG_QUALITY: u8 = 50;
/// Quality for the final pass, tuned for transfer size over fidelity
pub const TRANSFER_JPEG_QUALITY: u8 = 60;
/// Fixed geometric downscale applied to every preview frame
pub const DOWNSCALE_FACTOR: u32 = 4;

/// Final product of one pipeline cycle.
pub struct ProcessedFrame {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
    pub timestamp: i64,
}

/// Run one raw frame through the full transform. `None` means skip this
/// cycle; the capture stream is never halted by a bad frame.
pub fn process_frame(frame: &RawFrame) -> Option<ProcessedFrame> {
    let rgb = raw_to_rgb(frame)?;
    let full_jpeg = encode_rgb(&rgb, frame.width, frame.height, CAPTURE_JPEG_QUALITY)?;
    drop(rgb);

    let full = image::load_from_memory_with_format(&full_jpeg, ImageFormat::Jpeg).ok()?;
    drop(full_jpeg);

    let scaled_w = (frame.width / DOWNSCALE_FACTOR).max(1);
    let scaled_h = (frame.height / DOWNSCALE_FACTOR).max(1);
    let scaled = full.resize_exact(scaled_w, scaled_h, FilterType::Triangle);
    drop(full);

    let rotation = frame.rotation_degrees % 360;
    let upright = match rotation {
        0 => scaled,
        90 => scaled.rotate90(),
        180 => scaled.rotate180(),
        270 => scaled.rotate270(),
        other => {
            debug!(rotation = other, "unexpected rotation, leaving frame as-is");
            scaled
        }
    };
    let (width, height) = match rotation {
        90 | 270 => (scaled_h, scaled_w),
        _ => (scaled_w, scaled_h),
    };

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, TRANSFER_JPEG_QUALITY);
    upright.write_with_encoder(encoder).ok()?;

    Some(ProcessedFrame {
        width,
        height,
        jpeg: buf.into_inner(),
        timestamp: now_millis(),
    })
}

/// Spawn the processor task: pick up the newest raw frame whenever the slot
/// changes and publish the result into the output slot. Frames arriving
/// while one is being processed overwrite the slot and only the latest is
/// picked up next.
pub fn spawn_processor(
    mut raw: watch::Receiver<Option<Arc<RawFrame>>>,
) -> (watch::Receiver<Option<Arc<ProcessedFrame>>>, JoinHandle<()>) {
    let (output_tx, output_rx) = watch::channel(None);
    let handle = tokio::spawn(async move {
        while raw.changed().await.is_ok() {
            let frame = raw.borrow_and_update().clone();
            let Some(frame) = frame else { continue };
            match process_frame(&frame) {
                Some(processed) => {
                    let _ = output_tx.send(Some(Arc::new(processed)));
                }
                None => debug!("frame processing failed, skipping cycle"),
            }
        }
    });
    (output_rx, handle)
}

/// Convert the device's native pixel layout to interleaved RGB.
pub(crate) fn raw_to_rgb(frame: &RawFrame) -> Option<Vec<u8>> {
    match frame.format {
        PixelFormat::Nv21 => nv21_to_rgb(frame),
        PixelFormat::Bgra8 => bgra_to_rgb(frame),
    }
}

fn nv21_to_rgb(frame: &RawFrame) -> Option<Vec<u8>> {
    let w = frame.width as usize;
    let h = frame.height as usize;
    if frame.data.len() < w * h + (w * h) / 2 {
        return None;
    }
    let (y_plane, vu_plane) = frame.data.split_at(w * h);

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col] as f32;
            let vu = (row / 2) * w + (col / 2) * 2;
            let v = vu_plane[vu] as f32 - 128.0;
            let u = vu_plane[vu + 1] as f32 - 128.0;

            let r = y + 1.402 * v;
            let g = y - 0.344_136 * u - 0.714_136 * v;
            let b = y + 1.772 * u;
            rgb.push(r.clamp(0.0, 255.0) as u8);
            rgb.push(g.clamp(0.0, 255.0) as u8);
            rgb.push(b.clamp(0.0, 255.0) as u8);
        }
    }
    Some(rgb)
}

fn bgra_to_rgb(frame: &RawFrame) -> Option<Vec<u8>> {
    let w = frame.width as usize;
    let h = frame.height as usize;
    if h == 0 || frame.data.len() < w * h * 4 {
        return None;
    }
    // Stride may include row padding
    let stride = frame.data.len() / h;

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let offset = row * stride + col * 4;
            rgb.push(frame.data[offset + 2]);
            rgb.push(frame.data[offset + 1]);
            rgb.push(frame.data[offset]);
        }
    }
    Some(rgb)
}

pub(crate) fn encode_rgb(rgb: &[u8], width: u32, height: u32, quality: u8) -> Option<Vec<u8>> {
    let image: RgbImage = ImageBuffer::from_raw(width, height, rgb.to_vec())?;
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    image.write_with_encoder(encoder).ok()?;
    Some(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgra_frame(width: u32, height: u32, rotation_degrees: u16, fill: u8) -> RawFrame {
        RawFrame {
            width,
            height,
            rotation_degrees,
            format: PixelFormat::Bgra8,
            data: vec![fill; (width * height * 4) as usize],
        }
    }

    #[test]
    fn processes_to_downscaled_jpeg() {
        let frame = bgra_frame(64, 48, 0, 0x80);
        let processed = process_frame(&frame).expect("valid frame must process");
        assert_eq!(processed.width, 16);
        assert_eq!(processed.height, 12);
        // JPEG magic
        assert_eq!(&processed.jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn rotation_makes_the_frame_upright() {
        let frame = bgra_frame(64, 32, 90, 0x40);
        let processed = process_frame(&frame).unwrap();
        assert_eq!((processed.width, processed.height), (8, 16));

        let frame = bgra_frame(64, 32, 180, 0x40);
        let processed = process_frame(&frame).unwrap();
        assert_eq!((processed.width, processed.height), (16, 8));
    }

    #[test]
    fn truncated_buffers_skip_the_cycle() {
        let short_nv21 = RawFrame {
            width: 64,
            height: 48,
            rotation_degrees: 0,
            format: PixelFormat::Nv21,
            data: vec![0; 100],
        };
        assert!(process_frame(&short_nv21).is_none());

        let short_bgra = RawFrame {
            width: 64,
            height: 48,
            rotation_degrees: 0,
            format: PixelFormat::Bgra8,
            data: vec![0; 64],
        };
        assert!(process_frame(&short_bgra).is_none());
    }

    #[test]
    fn nv21_gray_converts_to_gray_rgb() {
        let w = 4usize;
        let h = 4usize;
        let mut data = vec![200u8; w * h]; // Y plane
        data.extend(vec![128u8; w * h / 2]); // neutral chroma
        let frame = RawFrame {
            width: w as u32,
            height: h as u32,
            rotation_degrees: 0,
            format: PixelFormat::Nv21,
            data,
        };
        let rgb = raw_to_rgb(&frame).unwrap();
        assert_eq!(rgb.len(), w * h * 3);
        // Neutral chroma means R == G == B == Y
        assert!(rgb.iter().all(|&channel| channel == 200));
    }

    #[tokio::test(start_paused = true)]
    async fn latest_frame_wins_under_backpressure() {
        let (raw_tx, raw_rx) = watch::channel(None);

        // Two frames land before the processor ever runs; only the newer
        // one may come out the far side.
        raw_tx.send(Some(Arc::new(bgra_frame(64, 48, 0, 0x10)))).unwrap();
        raw_tx.send(Some(Arc::new(bgra_frame(128, 96, 0, 0x20)))).unwrap();

        let (mut output_rx, handle) = spawn_processor(raw_rx);
        output_rx.changed().await.expect("one frame must come out");
        {
            let out = output_rx.borrow_and_update();
            let processed = out.as_ref().expect("processed frame");
            assert_eq!((processed.width, processed.height), (32, 24));
        }

        // Give the processor room to (incorrectly) emit the older frame.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!output_rx.has_changed().unwrap());

        handle.abort();
    }
}
