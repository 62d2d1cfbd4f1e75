//! Synthetic capture device.
//!
//! Generates a moving NV21 test pattern at a fixed cadence and honors the
//! same control surface as real hardware, so the session layer and the
//! frame pipeline can run end to end without a sensor. The pattern reacts
//! to exposure compensation and aspect ratio, which makes remote control
//! changes observable in the produced frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pipeline::{encode_rgb, raw_to_rgb};
use super::{CameraController, CaptureOutcome, PixelFormat, RawFrame};
use crate::protocol::{now_millis, AspectRatio, CameraLens, CameraState, FlashMode};

/// The synthetic sensor is mounted like a portrait phone sensor: frames
/// need a 90° turn to come out upright.
pub const SENSOR_ROTATION_DEGREES: u16 = 90;

const STILL_JPEG_QUALITY: u8 = 90;

pub fn frame_dims(aspect: AspectRatio) -> (u32, u32) {
    let width: u32 = match aspect {
        AspectRatio::Ratio1x1 => 480,
        _ => 640,
    };
    let height = (width as f32 / aspect.value()).round() as u32;
    (width, height)
}

/// Render one test-pattern frame: a diagonal luma gradient sliding with the
/// frame index over a fixed chroma wash, biased by exposure compensation.
pub fn test_frame(state: &CameraState, index: u64) -> RawFrame {
    let (width, height) = frame_dims(state.aspect_ratio);
    let (w, h) = (width as usize, height as usize);
    let shift = (index as usize) * 4;
    let bias = state.exposure_compensation * 4;

    let mut data = Vec::with_capacity(w * h + w * h / 2);
    for row in 0..h {
        for col in 0..w {
            let luma = (((col + row + shift) & 0xff) as i32 + bias).clamp(16, 235);
            data.push(luma as u8);
        }
    }
    for row in 0..h / 2 {
        for col in 0..w / 2 {
            data.push((row * 255 / (h / 2)) as u8); // V
            data.push((col * 255 / (w / 2)) as u8); // U
        }
    }

    RawFrame {
        width,
        height,
        rotation_degrees: SENSOR_ROTATION_DEGREES,
        format: PixelFormat::Nv21,
        data,
    }
}

pub struct SyntheticCamera {
    state_tx: watch::Sender<CameraState>,
    frames_tx: watch::Sender<Option<Arc<RawFrame>>>,
    frame_task: Mutex<Option<JoinHandle<()>>>,
    frame_index: Arc<AtomicU64>,
}

impl SyntheticCamera {
    pub fn new() -> Arc<Self> {
        let (state_tx, _) = watch::channel(CameraState::default());
        let (frames_tx, _) = watch::channel(None);
        Arc::new(Self {
            state_tx,
            frames_tx,
            frame_task: Mutex::new(None),
            frame_index: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Simulate the sensor coming up: publish its parameter ranges and flip
    /// the readiness flag.
    pub fn power_on(&self) {
        info!("synthetic camera powering on");
        self.state_tx.send_modify(|state| {
            state.min_zoom_ratio = 1.0;
            state.max_zoom_ratio = 5.0;
            state.zoom_ratio = 1.0;
            state.min_exposure_compensation = -6;
            state.max_exposure_compensation = 6;
            state.is_camera_ready = true;
        });
    }
}

impl CameraController for SyntheticCamera {
    fn camera_state(&self) -> watch::Receiver<CameraState> {
        self.state_tx.subscribe()
    }

    fn raw_frames(&self) -> watch::Receiver<Option<Arc<RawFrame>>> {
        self.frames_tx.subscribe()
    }

    fn set_zoom(&self, ratio: f32) {
        self.state_tx.send_modify(|state| {
            state.zoom_ratio = ratio.clamp(state.min_zoom_ratio, state.max_zoom_ratio);
        });
    }

    fn set_exposure_compensation(&self, value: i32) {
        self.state_tx.send_modify(|state| {
            state.exposure_compensation =
                value.clamp(state.min_exposure_compensation, state.max_exposure_compensation);
        });
    }

    fn set_aspect_ratio(&self, ratio: AspectRatio) {
        self.state_tx.send_modify(|state| state.aspect_ratio = ratio);
    }

    fn set_flash_mode(&self, mode: FlashMode) {
        self.state_tx.send_modify(|state| state.flash_mode = mode);
    }

    fn switch_lens(&self) {
        self.state_tx.send_modify(|state| {
            state.camera_lens = match state.camera_lens {
                CameraLens::Back => CameraLens::Front,
                CameraLens::Front => CameraLens::Back,
            };
        });
    }

    fn focus_at(&self, x: f32, y: f32) {
        debug!(x, y, "focus-and-meter");
    }

    fn capture_photo(&self) -> CaptureOutcome {
        let state = self.state_tx.borrow().clone();
        if !state.is_camera_ready {
            return CaptureOutcome::Error {
                message: "camera not ready".to_string(),
            };
        }

        let index = self.frame_index.load(Ordering::Relaxed);
        let frame = test_frame(&state, index);
        let Some(rgb) = raw_to_rgb(&frame) else {
            return CaptureOutcome::Error {
                message: "failed to render still".to_string(),
            };
        };
        let Some(jpeg) = encode_rgb(&rgb, frame.width, frame.height, STILL_JPEG_QUALITY) else {
            return CaptureOutcome::Error {
                message: "failed to encode still".to_string(),
            };
        };

        let path = std::env::temp_dir().join(format!("telecam_{}.jpg", now_millis()));
        match std::fs::write(&path, &jpeg) {
            Ok(()) => {
                info!(uri = %path.display(), "photo saved");
                CaptureOutcome::Success {
                    uri: path.display().to_string(),
                }
            }
            Err(err) => {
                warn!(%err, "failed to save photo");
                CaptureOutcome::Error {
                    message: err.to_string(),
                }
            }
        }
    }

    fn start_frames(&self, interval: Duration) {
        debug!(?interval, "starting frame generation");
        let mut task = self.frame_task.lock().expect("frame task lock poisoned");
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let state_rx = self.state_tx.subscribe();
        let frames_tx = self.frames_tx.clone();
        let frame_index = Arc::clone(&self.frame_index);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let state = state_rx.borrow().clone();
                if !state.is_camera_ready {
                    continue;
                }
                let index = frame_index.fetch_add(1, Ordering::Relaxed);
                let frame = test_frame(&state, index);
                let _ = frames_tx.send(Some(Arc::new(frame)));
            }
        }));
    }

    fn stop_frames(&self) {
        debug!("stopping frame generation");
        if let Some(task) = self.frame_task.lock().expect("frame task lock poisoned").take() {
            task.abort();
        }
        self.frames_tx.send_replace(None);
        self.frame_index.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_publishes_ranges_and_readiness() {
        let camera = SyntheticCamera::new();
        assert!(!camera.camera_state().borrow().is_camera_ready);

        camera.power_on();
        let state = camera.camera_state().borrow().clone();
        assert!(state.is_camera_ready);
        assert_eq!(state.min_zoom_ratio, 1.0);
        assert_eq!(state.max_zoom_ratio, 5.0);
        assert_eq!(state.min_exposure_compensation, -6);
        assert_eq!(state.max_exposure_compensation, 6);
    }

    #[test]
    fn controls_clamp_to_device_ranges() {
        let camera = SyntheticCamera::new();
        camera.power_on();

        camera.set_zoom(99.0);
        assert_eq!(camera.camera_state().borrow().zoom_ratio, 5.0);
        camera.set_zoom(0.1);
        assert_eq!(camera.camera_state().borrow().zoom_ratio, 1.0);

        camera.set_exposure_compensation(40);
        assert_eq!(camera.camera_state().borrow().exposure_compensation, 6);
    }

    #[test]
    fn progress_controls_map_through_the_ranges() {
        let camera = SyntheticCamera::new();
        camera.power_on();

        camera.set_zoom_by_progress(0.5);
        assert_eq!(camera.camera_state().borrow().zoom_ratio, 3.0);
        camera.set_exposure_by_progress(1.0);
        assert_eq!(camera.camera_state().borrow().exposure_compensation, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_flow_after_start() {
        let camera = SyntheticCamera::new();
        camera.power_on();
        let mut frames = camera.raw_frames();
        camera.start_frames(Duration::from_millis(150));

        frames.changed().await.expect("a frame must arrive");
        {
            let slot = frames.borrow_and_update();
            let frame = slot.as_ref().expect("frame present");
            assert_eq!((frame.width, frame.height), (640, 480));
            assert_eq!(frame.rotation_degrees, SENSOR_ROTATION_DEGREES);
        }

        camera.stop_frames();
        frames.changed().await.expect("slot cleared on stop");
        assert!(frames.borrow().is_none());
    }

    #[test]
    fn capture_before_power_on_fails() {
        let camera = SyntheticCamera::new();
        let outcome = camera.capture_photo();
        assert!(matches!(outcome, CaptureOutcome::Error { .. }));
    }

    #[test]
    fn capture_writes_a_jpeg_and_reports_the_uri() {
        let camera = SyntheticCamera::new();
        camera.power_on();
        match camera.capture_photo() {
            CaptureOutcome::Success { uri } => {
                let bytes = std::fs::read(&uri).expect("saved file readable");
                assert_eq!(&bytes[..2], &[0xff, 0xd8]);
                let _ = std::fs::remove_file(&uri);
            }
            CaptureOutcome::Error { message } => panic!("capture failed: {message}"),
        }
    }
}
