//! Remote-role orchestration.
//!
//! Discovers and connects to a camera, keeps an optimistic local copy of its
//! state, decodes incoming preview frames for display, and drives the camera
//! with partial control updates and capture commands.

use std::sync::{Arc, Mutex};

use image::{ImageFormat, RgbImage};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{spawn_ping_loop, CAPTURE_TIMEOUT};
use crate::connection::ConnectionManager;
use crate::protocol::{
    decode_image_base64, now_millis, AspectRatio, CameraState, FlashMode, Message,
};

/// A preview frame decoded back into pixels, ready for display.
#[derive(Debug, Clone)]
pub struct PreviewImage {
    pub width: u32,
    pub height: u32,
    pub image: RgbImage,
    /// Capture-side timestamp carried in the message
    pub timestamp: i64,
}

impl PreviewImage {
    fn decode(jpeg_base64: &str, timestamp: i64) -> Option<Self> {
        let jpeg = decode_image_base64(jpeg_base64)?;
        let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
            .ok()?
            .to_rgb8();
        Some(Self {
            width: image.width(),
            height: image.height(),
            image,
            timestamp,
        })
    }
}

/// Capture outcome as reported by the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub success: bool,
    pub photo_uri: Option<String>,
    pub error_message: Option<String>,
}

pub struct RemoteSession {
    connection: Arc<ConnectionManager>,
    camera_state_tx: watch::Sender<CameraState>,
    preview_tx: watch::Sender<Option<Arc<PreviewImage>>>,
    confirmation_tx: watch::Sender<Option<CaptureReport>>,
    is_capturing_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteSession {
    pub fn new(connection: Arc<ConnectionManager>) -> Arc<Self> {
        let (camera_state_tx, _) = watch::channel(CameraState::default());
        let (preview_tx, _) = watch::channel(None);
        let (confirmation_tx, _) = watch::channel(None);
        let (is_capturing_tx, _) = watch::channel(false);
        Arc::new(Self {
            connection,
            camera_state_tx,
            preview_tx,
            confirmation_tx,
            is_capturing_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Begin discovery and bring up the session tasks. The inbound
    /// subscription is taken before the transport starts so nothing sent
    /// during the handshake can be missed.
    pub fn start(self: &Arc<Self>) {
        info!("remote session starting");
        let mut tasks = self.tasks.lock().expect("task list poisoned");

        tasks.push(spawn_ping_loop(Arc::clone(&self.connection)));

        {
            let session = Arc::clone(self);
            let mut inbox = self.connection.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    match inbox.recv().await {
                        Ok((_endpoint_id, message)) => session.handle_message(message),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "remote dispatch lagging, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        drop(tasks);
        self.connection.start_as_remote();
    }

    /// Tear the session down and clear anything a UI might still be
    /// observing: a stale frame or a stuck capturing flag must not survive
    /// the session.
    pub fn stop(&self) {
        info!("remote session stopping");
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        self.connection.disconnect_all();
        self.preview_tx.send_replace(None);
        self.confirmation_tx.send_replace(None);
        self.is_capturing_tx.send_replace(false);
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::PreviewFrame {
                jpeg_base64,
                timestamp,
            } => match PreviewImage::decode(&jpeg_base64, timestamp) {
                Some(frame) => {
                    self.preview_tx.send_replace(Some(Arc::new(frame)));
                }
                None => warn!("failed to decode preview frame, dropping"),
            },
            Message::StateSync { state } => {
                debug!(zoom = state.zoom_ratio, ready = state.is_camera_ready, "state sync");
                self.camera_state_tx.send_replace(state);
            }
            Message::CaptureConfirmation {
                success,
                photo_uri,
                error_message,
            } => {
                info!(success, ?photo_uri, "capture confirmation");
                self.is_capturing_tx.send_replace(false);
                self.confirmation_tx.send_replace(Some(CaptureReport {
                    success,
                    photo_uri,
                    error_message,
                }));
            }
            Message::QualityUpdate { latency_ms, .. } => {
                debug!(latency_ms, "camera-side quality update");
            }
            other => debug!(kind = other.kind(), "ignoring message"),
        }
    }

    pub fn set_zoom(&self, progress: f32) {
        let ratio = {
            let state = self.camera_state_tx.borrow();
            state.min_zoom_ratio + (state.max_zoom_ratio - state.min_zoom_ratio) * progress
        };
        self.camera_state_tx
            .send_modify(|state| state.zoom_ratio = ratio);
        self.send_control_update(Some(ratio), None, None, None);
    }

    pub fn set_exposure(&self, progress: f32) {
        let value = {
            let state = self.camera_state_tx.borrow();
            state.min_exposure_compensation
                + ((state.max_exposure_compensation - state.min_exposure_compensation) as f32
                    * progress) as i32
        };
        self.camera_state_tx
            .send_modify(|state| state.exposure_compensation = value);
        self.send_control_update(None, Some(value), None, None);
    }

    pub fn set_aspect_ratio(&self, ratio: AspectRatio) {
        self.camera_state_tx
            .send_modify(|state| state.aspect_ratio = ratio);
        self.send_control_update(None, None, Some(ratio), None);
    }

    pub fn set_flash_mode(&self, mode: FlashMode) {
        self.camera_state_tx
            .send_modify(|state| state.flash_mode = mode);
        self.send_control_update(None, None, None, Some(mode));
    }

    /// Optimistic: the local cache changes immediately, the wire message
    /// carries only the changed field, and the camera's StateSync settles
    /// the authoritative value afterwards.
    fn send_control_update(
        &self,
        zoom_ratio: Option<f32>,
        exposure_compensation: Option<i32>,
        aspect_ratio: Option<AspectRatio>,
        flash_mode: Option<FlashMode>,
    ) {
        self.connection.send_to_all(&Message::ControlUpdate {
            zoom_ratio,
            exposure_compensation,
            aspect_ratio,
            flash_mode,
        });
    }

    /// Ask the camera for a tap-to-focus at normalized [0, 1] coordinates.
    pub fn focus_at(&self, x: f32, y: f32) {
        debug!(x, y, "sending focus point");
        self.connection.send_to_all(&Message::FocusPoint { x, y });
    }

    /// Send a capture command and wait for the confirmation, or give up
    /// after [`CAPTURE_TIMEOUT`]: the camera may have vanished mid-flight
    /// and the capturing flag must never stick.
    pub fn capture_photo(self: &Arc<Self>) {
        if *self.is_capturing_tx.borrow() {
            debug!("capture already in flight");
            return;
        }
        info!("triggering remote capture");
        self.is_capturing_tx.send_replace(true);
        self.confirmation_tx.send_replace(None);

        self.connection.send_to_all(&Message::CaptureCommand {
            sender_id: format!("remote_{}", now_millis()),
            timestamp: now_millis(),
        });

        let session = Arc::clone(self);
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(CAPTURE_TIMEOUT).await;
            if *session.is_capturing_tx.borrow() {
                warn!("capture confirmation timeout");
                session.is_capturing_tx.send_replace(false);
            }
        });
        self.tasks
            .lock()
            .expect("task list poisoned")
            .push(timeout_task);
    }

    /// Nudge the link; the camera keeps streaming on its own.
    pub fn refresh_preview(&self) {
        debug!("refresh preview requested");
        self.connection.send_ping();
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn camera_state(&self) -> watch::Receiver<CameraState> {
        self.camera_state_tx.subscribe()
    }

    pub fn preview(&self) -> watch::Receiver<Option<Arc<PreviewImage>>> {
        self.preview_tx.subscribe()
    }

    pub fn capture_confirmation(&self) -> watch::Receiver<Option<CaptureReport>> {
        self.confirmation_tx.subscribe()
    }

    pub fn is_capturing(&self) -> watch::Receiver<bool> {
        self.is_capturing_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackTransport;
    use std::time::Duration;

    fn session() -> Arc<RemoteSession> {
        let ((transport, _events), _other) = LoopbackTransport::pair();
        RemoteSession::new(ConnectionManager::new(Arc::new(transport), "remote"))
    }

    #[tokio::test(start_paused = true)]
    async fn capturing_clears_after_timeout_without_confirmation() {
        let session = session();
        session.capture_photo();
        assert!(*session.is_capturing().borrow());

        tokio::time::sleep(CAPTURE_TIMEOUT + Duration::from_millis(100)).await;
        assert!(!*session.is_capturing().borrow());
        assert!(session.capture_confirmation().borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_clears_capturing_before_the_timeout() {
        let session = session();
        session.capture_photo();
        assert!(*session.is_capturing().borrow());

        session.handle_message(Message::CaptureConfirmation {
            success: true,
            photo_uri: Some("/tmp/photo.jpg".into()),
            error_message: None,
        });
        assert!(!*session.is_capturing().borrow());
        let report = session.capture_confirmation().borrow().clone().unwrap();
        assert!(report.success);

        // The timeout firing later must not disturb anything.
        tokio::time::sleep(CAPTURE_TIMEOUT + Duration::from_millis(100)).await;
        assert!(!*session.is_capturing().borrow());
        assert!(session.capture_confirmation().borrow().is_some());
    }

    #[tokio::test]
    async fn state_sync_overwrites_the_cache_wholesale() {
        let session = session();
        session.set_flash_mode(FlashMode::On); // optimistic local change

        let authoritative = CameraState {
            zoom_ratio: 2.0,
            max_zoom_ratio: 5.0,
            is_camera_ready: true,
            ..CameraState::default()
        };
        session.handle_message(Message::StateSync {
            state: authoritative.clone(),
        });
        assert_eq!(*session.camera_state().borrow(), authoritative);
    }

    #[tokio::test]
    async fn undecodable_preview_is_dropped() {
        let session = session();
        session.handle_message(Message::PreviewFrame {
            jpeg_base64: "!!!not-base64!!!".into(),
            timestamp: 0,
        });
        assert!(session.preview().borrow().is_none());

        // Valid base64, invalid JPEG
        session.handle_message(Message::PreviewFrame {
            jpeg_base64: crate::protocol::encode_image_base64(&[1, 2, 3, 4]),
            timestamp: 0,
        });
        assert!(session.preview().borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_published_state() {
        let session = session();
        session.capture_photo();
        session.handle_message(Message::PreviewFrame {
            jpeg_base64: String::new(),
            timestamp: 0,
        });
        session.stop();
        assert!(!*session.is_capturing().borrow());
        assert!(session.preview().borrow().is_none());

        // The aborted timeout task must not fire afterwards.
        tokio::time::sleep(CAPTURE_TIMEOUT + Duration::from_millis(100)).await;
        assert!(!*session.is_capturing().borrow());
    }
}
