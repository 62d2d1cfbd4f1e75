//! Capture device seam and the preview frame pipeline.
//!
//! The sensor itself is an external collaborator: something that reports
//! readiness and parameter ranges, hands out raw frames, and executes
//! imperative controls. The [`SyntheticCamera`](synthetic::SyntheticCamera)
//! stands in for hardware so the whole path runs in tests and the demo.

pub mod pipeline;
pub mod synthetic;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::protocol::{AspectRatio, CameraState, FlashMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Full Y plane followed by interleaved V/U, 2x2 subsampled
    Nv21,
    /// 32-bit interleaved BGRA, possibly with row padding
    Bgra8,
}

/// One raw sensor frame, in the device's native pixel format.
#[derive(Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Sensor-reported rotation needed to make the image upright
    pub rotation_degrees: u16,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

/// Outcome of a still capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Success { uri: String },
    Error { message: String },
}

impl CaptureOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CaptureOutcome::Success { .. })
    }
}

/// Narrow interface to the capture device.
///
/// State and raw frames are published on `watch` channels; the device is the
/// only mutator of both. Controls are fire-and-forget, reflected back through
/// the state channel once applied.
pub trait CameraController: Send + Sync {
    fn camera_state(&self) -> watch::Receiver<CameraState>;
    /// Latest-value slot: a new raw frame replaces an unconsumed older one.
    fn raw_frames(&self) -> watch::Receiver<Option<Arc<RawFrame>>>;

    fn set_zoom(&self, ratio: f32);
    fn set_exposure_compensation(&self, value: i32);
    fn set_aspect_ratio(&self, ratio: AspectRatio);
    fn set_flash_mode(&self, mode: FlashMode);
    fn switch_lens(&self);
    /// Focus-and-meter at normalized [0, 1] coordinates.
    fn focus_at(&self, x: f32, y: f32);
    fn capture_photo(&self) -> CaptureOutcome;

    fn start_frames(&self, interval: Duration);
    fn stop_frames(&self);

    fn set_zoom_by_progress(&self, progress: f32) {
        let state = self.camera_state().borrow().clone();
        let ratio =
            state.min_zoom_ratio + (state.max_zoom_ratio - state.min_zoom_ratio) * progress;
        self.set_zoom(ratio);
    }

    fn set_exposure_by_progress(&self, progress: f32) {
        let state = self.camera_state().borrow().clone();
        let value = state.min_exposure_compensation
            + ((state.max_exposure_compensation - state.min_exposure_compensation) as f32
                * progress) as i32;
        self.set_exposure_compensation(value);
    }
}
