//! Camera-role orchestration.
//!
//! Advertises, streams preview frames to every connected peer, executes
//! capture/control/focus commands from remotes, and keeps remotes in sync by
//! broadcasting the authoritative camera state after every change.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{spawn_ping_loop, PREVIEW_FRAME_INTERVAL};
use crate::camera::{pipeline, CameraController, CaptureOutcome};
use crate::connection::ConnectionManager;
use crate::protocol::{encode_image_base64, AspectRatio, FlashMode, Message};

pub struct CameraSession {
    connection: Arc<ConnectionManager>,
    camera: Arc<dyn CameraController>,
    frame_interval: Duration,
    is_capturing_tx: watch::Sender<bool>,
    last_capture_tx: watch::Sender<Option<CaptureOutcome>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CameraSession {
    pub fn new(connection: Arc<ConnectionManager>, camera: Arc<dyn CameraController>) -> Arc<Self> {
        Self::with_frame_interval(connection, camera, PREVIEW_FRAME_INTERVAL)
    }

    pub fn with_frame_interval(
        connection: Arc<ConnectionManager>,
        camera: Arc<dyn CameraController>,
        frame_interval: Duration,
    ) -> Arc<Self> {
        let (is_capturing_tx, _) = watch::channel(false);
        let (last_capture_tx, _) = watch::channel(None);
        Arc::new(Self {
            connection,
            camera,
            frame_interval,
            is_capturing_tx,
            last_capture_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Begin advertising and bring up the session tasks. Observers are wired
    /// before the transport is started so no early event can slip past them.
    pub fn start(self: &Arc<Self>) {
        info!("camera session starting");
        let mut tasks = self.tasks.lock().expect("task list poisoned");

        tasks.push(spawn_ping_loop(Arc::clone(&self.connection)));

        // Start the device's frame stream once it reports ready.
        {
            let session = Arc::clone(self);
            let mut state_rx = self.camera.camera_state();
            tasks.push(tokio::spawn(async move {
                loop {
                    if state_rx.borrow_and_update().is_camera_ready {
                        break;
                    }
                    if state_rx.changed().await.is_err() {
                        return;
                    }
                }
                info!("camera ready, starting preview streaming");
                session.camera.start_frames(session.frame_interval);
            }));
        }

        // Processor feeds the output slot; the sender drains it. Producer,
        // processor and sender only touch each other through the slots, so a
        // slow transport costs dropped frames, not capture latency.
        let (mut frames_rx, processor) = pipeline::spawn_processor(self.camera.raw_frames());
        tasks.push(processor);
        {
            let connection = Arc::clone(&self.connection);
            tasks.push(tokio::spawn(async move {
                while frames_rx.changed().await.is_ok() {
                    let frame = frames_rx.borrow_and_update().clone();
                    let Some(frame) = frame else { continue };
                    if connection.peers().is_empty() {
                        continue;
                    }
                    let message = Message::PreviewFrame {
                        jpeg_base64: encode_image_base64(&frame.jpeg),
                        timestamp: frame.timestamp,
                    };
                    connection.send_to_all(&message);
                }
            }));
        }

        // Sync full state whenever a peer joins, so late joiners see the
        // current parameters.
        {
            let session = Arc::clone(self);
            let mut peers_rx = self.connection.watch_peers();
            let mut previous = peers_rx.borrow_and_update().len();
            tasks.push(tokio::spawn(async move {
                while peers_rx.changed().await.is_ok() {
                    let current = peers_rx.borrow_and_update().len();
                    if current > previous {
                        info!(peers = current, "peer joined, syncing state");
                        session.sync_state();
                    }
                    previous = current;
                }
            }));
        }

        // Share each new latency measurement with the remotes.
        {
            let connection = Arc::clone(&self.connection);
            let mut quality_rx = self.connection.watch_quality();
            quality_rx.borrow_and_update();
            tasks.push(tokio::spawn(async move {
                while quality_rx.changed().await.is_ok() {
                    let quality = *quality_rx.borrow_and_update();
                    connection.send_to_all(&Message::QualityUpdate {
                        latency_ms: quality.latency_ms,
                        timestamp: quality.last_updated,
                    });
                }
            }));
        }

        // Inbound command dispatch.
        {
            let session = Arc::clone(self);
            let mut inbox = self.connection.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    match inbox.recv().await {
                        Ok((endpoint_id, message)) => session.handle_message(&endpoint_id, message),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "command dispatch lagging, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        drop(tasks);
        self.connection.start_as_camera();
    }

    /// Tear the session down: cancel every task and clear state that would
    /// otherwise outlive it.
    pub fn stop(&self) {
        info!("camera session stopping");
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        self.camera.stop_frames();
        self.connection.disconnect_all();
        self.is_capturing_tx.send_replace(false);
        self.last_capture_tx.send_replace(None);
    }

    fn handle_message(&self, endpoint_id: &str, message: Message) {
        match message {
            Message::CaptureCommand { sender_id, .. } => {
                debug!(endpoint = %endpoint_id, %sender_id, "capture command");
                self.capture_photo();
            }
            Message::ControlUpdate {
                zoom_ratio,
                exposure_compensation,
                aspect_ratio,
                flash_mode,
            } => {
                debug!(
                    ?zoom_ratio,
                    ?exposure_compensation,
                    "control update"
                );
                self.apply_control(zoom_ratio, exposure_compensation, aspect_ratio, flash_mode);
            }
            Message::FocusPoint { x, y } => {
                debug!(x, y, "focus point");
                self.camera.focus_at(x, y);
            }
            other => debug!(kind = other.kind(), "ignoring message"),
        }
    }

    /// Apply only the fields present, then broadcast the authoritative
    /// post-apply state: senders see the result, not an echo.
    fn apply_control(
        &self,
        zoom_ratio: Option<f32>,
        exposure_compensation: Option<i32>,
        aspect_ratio: Option<AspectRatio>,
        flash_mode: Option<FlashMode>,
    ) {
        if let Some(ratio) = zoom_ratio {
            self.camera.set_zoom(ratio);
        }
        if let Some(value) = exposure_compensation {
            self.camera.set_exposure_compensation(value);
        }
        if let Some(ratio) = aspect_ratio {
            self.camera.set_aspect_ratio(ratio);
        }
        if let Some(mode) = flash_mode {
            self.camera.set_flash_mode(mode);
        }
        self.sync_state();
    }

    /// Run the same capture path a local shutter tap uses and tell every
    /// peer how it went, whoever asked for it.
    pub fn capture_photo(&self) {
        if *self.is_capturing_tx.borrow() {
            debug!("capture already in progress");
            return;
        }
        self.is_capturing_tx.send_replace(true);

        let outcome = self.camera.capture_photo();
        debug!(success = outcome.is_success(), "photo captured");
        self.last_capture_tx.send_replace(Some(outcome.clone()));

        let confirmation = match outcome {
            CaptureOutcome::Success { uri } => Message::CaptureConfirmation {
                success: true,
                photo_uri: Some(uri),
                error_message: None,
            },
            CaptureOutcome::Error { message } => Message::CaptureConfirmation {
                success: false,
                photo_uri: None,
                error_message: Some(message),
            },
        };
        self.connection.send_to_all(&confirmation);
        self.is_capturing_tx.send_replace(false);
    }

    pub fn set_zoom(&self, progress: f32) {
        self.camera.set_zoom_by_progress(progress);
        self.sync_state();
    }

    pub fn set_exposure(&self, progress: f32) {
        self.camera.set_exposure_by_progress(progress);
        self.sync_state();
    }

    pub fn set_aspect_ratio(&self, ratio: AspectRatio) {
        self.camera.set_aspect_ratio(ratio);
        self.sync_state();
    }

    pub fn set_flash_mode(&self, mode: FlashMode) {
        self.camera.set_flash_mode(mode);
        self.sync_state();
    }

    pub fn switch_lens(&self) {
        self.camera.switch_lens();
        self.sync_state();
    }

    pub fn focus_at(&self, x: f32, y: f32) {
        self.camera.focus_at(x, y);
    }

    fn sync_state(&self) {
        let state = self.camera.camera_state().borrow().clone();
        self.connection.send_to_all(&Message::StateSync { state });
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn camera_state(&self) -> watch::Receiver<crate::protocol::CameraState> {
        self.camera.camera_state()
    }

    pub fn is_capturing(&self) -> watch::Receiver<bool> {
        self.is_capturing_tx.subscribe()
    }

    pub fn last_capture(&self) -> watch::Receiver<Option<CaptureOutcome>> {
        self.last_capture_tx.subscribe()
    }
}
