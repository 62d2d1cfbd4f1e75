//! Role orchestration.
//!
//! A session wires one role's behavior on top of the connection manager and
//! (for the camera) the capture device: the ping loop, state-sync
//! discipline, inbound message dispatch, and the frame sender. Sessions own
//! their tasks and abort them on `stop()`, clearing any published state that
//! would otherwise go stale past session end.

pub mod camera;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::connection::ConnectionManager;

/// Cadence of the diagnostic liveness loop
pub const PING_INTERVAL: Duration = Duration::from_secs(2);
/// How long the remote waits for a capture confirmation before giving up
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default raw frame cadence (~6-7 fps)
pub const PREVIEW_FRAME_INTERVAL: Duration = Duration::from_millis(150);

/// Ping all peers every [`PING_INTERVAL`] while at least one is connected.
/// Purely diagnostic; it shares nothing with the frame path and is cancelled
/// with the session.
pub(crate) fn spawn_ping_loop(connection: Arc<ConnectionManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.tick().await; // the first tick completes immediately
        loop {
            ticker.tick().await;
            if !connection.peers().is_empty() {
                connection.send_ping();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::camera::CameraSession;
    use super::remote::RemoteSession;
    use super::*;
    use crate::camera::synthetic::SyntheticCamera;
    use crate::camera::CameraController;
    use crate::connection::ConnectionState;
    use crate::protocol::FlashMode;
    use crate::transport::loopback::LoopbackTransport;

    struct Rig {
        device: Arc<SyntheticCamera>,
        camera: Arc<CameraSession>,
        remote: Arc<RemoteSession>,
    }

    /// Full two-role setup over the loopback transport, camera powered on
    /// and both sessions started.
    fn start_rig() -> Rig {
        let ((camera_tp, camera_events), (remote_tp, remote_events)) = LoopbackTransport::pair();

        let camera_conn = ConnectionManager::new(Arc::new(camera_tp), "camera-under-test");
        camera_conn.spawn_event_loop(camera_events);
        let remote_conn = ConnectionManager::new(Arc::new(remote_tp), "remote-under-test");
        remote_conn.spawn_event_loop(remote_events);

        let device = SyntheticCamera::new();
        device.power_on();
        let controller: Arc<dyn CameraController> = device.clone();
        let camera = CameraSession::new(camera_conn, controller);
        camera.start();
        let remote = RemoteSession::new(remote_conn);
        remote.start();

        Rig {
            device,
            camera,
            remote,
        }
    }

    async fn wait_connected(session_conn: &ConnectionManager) {
        let mut state_rx = session_conn.watch_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *state_rx.borrow_and_update() == ConnectionState::Connected {
                    break;
                }
                state_rx.changed().await.expect("state channel open");
            }
        })
        .await
        .expect("roles must connect over loopback");
    }

    #[tokio::test(start_paused = true)]
    async fn remote_receives_state_sync_on_join() {
        let rig = start_rig();
        wait_connected(rig.remote.connection()).await;

        let mut cached = rig.remote.camera_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if cached.borrow_and_update().is_camera_ready {
                    break;
                }
                cached.changed().await.expect("state channel open");
            }
        })
        .await
        .expect("state sync must arrive after join");

        let state = rig.remote.camera_state().borrow().clone();
        assert_eq!(state.max_zoom_ratio, 5.0);
        assert_eq!(state.min_exposure_compensation, -6);

        rig.camera.stop();
        rig.remote.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn preview_frames_reach_the_remote_decoded() {
        let rig = start_rig();
        wait_connected(rig.remote.connection()).await;

        let mut preview = rig.remote.preview();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if preview.borrow_and_update().is_some() {
                    break;
                }
                preview.changed().await.expect("preview channel open");
            }
        })
        .await
        .expect("a decoded preview frame must arrive");

        let frame = rig.remote.preview().borrow().clone().unwrap();
        // 640x480 sensor frame, 4x downscale, then the 90° upright turn
        assert_eq!((frame.width, frame.height), (120, 160));

        rig.camera.stop();
        rig.remote.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn control_round_trip_applies_on_the_device() {
        let rig = start_rig();
        wait_connected(rig.remote.connection()).await;

        rig.remote.set_flash_mode(FlashMode::On);
        // Optimistic cache flips immediately
        assert_eq!(rig.remote.camera_state().borrow().flash_mode, FlashMode::On);

        let mut device_state = rig.device.camera_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if device_state.borrow_and_update().flash_mode == FlashMode::On {
                    break;
                }
                device_state.changed().await.expect("device state open");
            }
        })
        .await
        .expect("control update must land on the device");

        rig.camera.stop();
        rig.remote.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn remote_capture_round_trip_confirms() {
        let rig = start_rig();
        wait_connected(rig.remote.connection()).await;

        rig.remote.capture_photo();
        assert!(*rig.remote.is_capturing().borrow());

        let mut confirmation = rig.remote.capture_confirmation();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if confirmation.borrow_and_update().is_some() {
                    break;
                }
                confirmation.changed().await.expect("confirmation channel open");
            }
        })
        .await
        .expect("confirmation must arrive");

        let report = rig.remote.capture_confirmation().borrow().clone().unwrap();
        assert!(report.success);
        let uri = report.photo_uri.expect("successful capture carries a uri");
        assert!(std::fs::metadata(&uri).is_ok());
        let _ = std::fs::remove_file(&uri);

        assert!(!*rig.remote.is_capturing().borrow());

        rig.camera.stop();
        rig.remote.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn ping_loop_measures_latency() {
        let rig = start_rig();
        wait_connected(rig.remote.connection()).await;

        let mut quality = rig.remote.connection().watch_quality();
        let before = *quality.borrow_and_update();
        tokio::time::timeout(Duration::from_secs(10), quality.changed())
            .await
            .expect("a pong must land within a few ping intervals")
            .expect("quality channel open");
        let after = *quality.borrow();
        assert!(after.last_updated >= before.last_updated);

        rig.camera.stop();
        rig.remote.stop();
    }
}
