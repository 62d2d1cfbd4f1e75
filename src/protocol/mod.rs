//! Wire protocol between the camera and remote roles.
//!
//! Messages are JSON with a self-describing `"type"` tag so either side can
//! dispatch without out-of-band context. Decoding is tolerant: unknown keys
//! are ignored and optional fields default when absent, so a newer peer can
//! talk to an older one. JPEG payloads travel base64-encoded inside the
//! message, since the transport gives us exactly one opaque byte payload
//! per send.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Unix timestamp in milliseconds, the unit every wire timestamp uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "RATIO_4_3")]
    Ratio4x3,
    #[serde(rename = "RATIO_16_9")]
    Ratio16x9,
    #[serde(rename = "RATIO_1_1")]
    Ratio1x1,
}

impl AspectRatio {
    pub fn value(self) -> f32 {
        match self {
            AspectRatio::Ratio4x3 => 4.0 / 3.0,
            AspectRatio::Ratio16x9 => 16.0 / 9.0,
            AspectRatio::Ratio1x1 => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AspectRatio::Ratio4x3 => "4:3",
            AspectRatio::Ratio16x9 => "16:9",
            AspectRatio::Ratio1x1 => "1:1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlashMode {
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraLens {
    Back,
    Front,
}

/// Full camera parameter set.
///
/// On the camera role this is the source of truth, mutated by the device and
/// by applying inbound control messages. On the remote role it is a cache,
/// overwritten wholesale by every `StateSync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CameraState {
    pub zoom_ratio: f32,
    pub min_zoom_ratio: f32,
    pub max_zoom_ratio: f32,
    pub exposure_compensation: i32,
    pub min_exposure_compensation: i32,
    pub max_exposure_compensation: i32,
    pub aspect_ratio: AspectRatio,
    pub flash_mode: FlashMode,
    pub camera_lens: CameraLens,
    pub is_camera_ready: bool,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            zoom_ratio: 1.0,
            min_zoom_ratio: 1.0,
            max_zoom_ratio: 1.0,
            exposure_compensation: 0,
            min_exposure_compensation: 0,
            max_exposure_compensation: 0,
            aspect_ratio: AspectRatio::Ratio4x3,
            flash_mode: FlashMode::Auto,
            camera_lens: CameraLens::Back,
            is_camera_ready: false,
        }
    }
}

impl CameraState {
    /// Zoom position mapped to [0, 1]. Derived on read, never stored.
    pub fn zoom_progress(&self) -> f32 {
        if self.max_zoom_ratio > self.min_zoom_ratio {
            (self.zoom_ratio - self.min_zoom_ratio) / (self.max_zoom_ratio - self.min_zoom_ratio)
        } else {
            0.0
        }
    }

    /// Exposure position mapped to [0, 1].
    pub fn exposure_progress(&self) -> f32 {
        if self.max_exposure_compensation > self.min_exposure_compensation {
            (self.exposure_compensation - self.min_exposure_compensation) as f32
                / (self.max_exposure_compensation - self.min_exposure_compensation) as f32
        } else {
            0.5
        }
    }
}

/// Message types sent over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Message {
    // Camera -> Remote(s)
    /// One downsampled preview frame, JPEG carried as base64
    PreviewFrame { jpeg_base64: String, timestamp: i64 },
    /// Outcome of a still capture, broadcast to every peer
    CaptureConfirmation {
        success: bool,
        photo_uri: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
    /// Full-state broadcast so peers can refresh their cached parameters
    StateSync { state: CameraState },
    /// Camera-side view of the measured link latency
    QualityUpdate { latency_ms: i64, timestamp: i64 },

    // Remote -> Camera
    /// Trigger a still capture
    CaptureCommand { sender_id: String, timestamp: i64 },
    /// Partial update; absent fields leave the camera untouched
    ControlUpdate {
        #[serde(default)]
        zoom_ratio: Option<f32>,
        #[serde(default)]
        exposure_compensation: Option<i32>,
        #[serde(default)]
        aspect_ratio: Option<AspectRatio>,
        #[serde(default)]
        flash_mode: Option<FlashMode>,
    },
    /// Tap-to-focus, both coordinates normalized to [0, 1]
    FocusPoint { x: f32, y: f32 },

    // Either direction, latency measurement
    Ping { timestamp: i64 },
    Pong {
        original_timestamp: i64,
        response_timestamp: i64,
    },
}

impl Message {
    /// Variant name, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PreviewFrame { .. } => "PreviewFrame",
            Message::CaptureConfirmation { .. } => "CaptureConfirmation",
            Message::StateSync { .. } => "StateSync",
            Message::QualityUpdate { .. } => "QualityUpdate",
            Message::CaptureCommand { .. } => "CaptureCommand",
            Message::ControlUpdate { .. } => "ControlUpdate",
            Message::FocusPoint { .. } => "FocusPoint",
            Message::Ping { .. } => "Ping",
            Message::Pong { .. } => "Pong",
        }
    }

    pub fn ping() -> Self {
        Message::Ping {
            timestamp: now_millis(),
        }
    }

    pub fn pong(original_timestamp: i64) -> Self {
        Message::Pong {
            original_timestamp,
            response_timestamp: now_millis(),
        }
    }
}

/// Serialize a message for one transmission.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

/// Deserialize inbound bytes. Returns `None` on any malformed input and the
/// caller drops the message; a bad payload never has connection-level
/// consequences.
pub fn decode(bytes: &[u8]) -> Option<Message> {
    serde_json::from_slice(bytes).ok()
}

pub fn encode_image_base64(jpeg: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(jpeg)
}

pub fn decode_image_base64(encoded: &str) -> Option<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}
