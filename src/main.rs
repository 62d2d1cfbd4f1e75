mod camera;
mod cli;
mod connection;
mod protocol;
mod session;
mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use camera::synthetic::SyntheticCamera;
use camera::CameraController;
use cli::{Cli, Commands};
use connection::{ConnectionManager, ConnectionState};
use protocol::{AspectRatio, FlashMode};
use session::camera::CameraSession;
use session::remote::RemoteSession;
use transport::loopback::LoopbackTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse_args();
    match cli.command {
        Commands::Demo { duration, interval } => {
            run_demo(
                Duration::from_secs(duration),
                Duration::from_millis(interval),
            )
            .await
        }
        Commands::Frame { output } => render_frame(&output),
    }
}

/// Wire a camera session and a remote session to the two ends of the
/// loopback transport and let them talk: preview streaming, control changes
/// from both sides, a remote-triggered capture, and the latency loop.
async fn run_demo(duration: Duration, interval: Duration) -> Result<()> {
    info!("starting demo: camera and remote over the loopback transport");

    let ((camera_tp, camera_events), (remote_tp, remote_events)) = LoopbackTransport::pair();

    let camera_conn = ConnectionManager::new(Arc::new(camera_tp), "demo-camera");
    camera_conn.spawn_event_loop(camera_events);
    let remote_conn = ConnectionManager::new(Arc::new(remote_tp), "demo-remote");
    remote_conn.spawn_event_loop(remote_events);

    let device = SyntheticCamera::new();
    let controller: Arc<dyn CameraController> = device.clone();
    let camera = CameraSession::with_frame_interval(Arc::clone(&camera_conn), controller, interval);
    camera.start();
    device.power_on();

    // Local operator preps the camera before anyone connects
    camera.set_aspect_ratio(AspectRatio::Ratio16x9);
    camera.set_zoom(0.0);

    let remote = RemoteSession::new(Arc::clone(&remote_conn));
    remote.start();

    let mut state_rx = remote_conn.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Connected {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .context("roles failed to connect")?;
    info!("roles connected");
    remote.refresh_preview();

    // Count decoded frames as they arrive on the remote side
    let frames_seen = Arc::new(AtomicU64::new(0));
    {
        let frames_seen = Arc::clone(&frames_seen);
        let mut preview = remote.preview();
        tokio::spawn(async move {
            while preview.changed().await.is_ok() {
                let bytes = preview
                    .borrow_and_update()
                    .as_ref()
                    .map(|frame| frame.image.as_raw().len());
                if let Some(bytes) = bytes {
                    frames_seen.fetch_add(1, Ordering::Relaxed);
                    debug!(bytes, "preview frame decoded");
                }
            }
        });
    }

    tokio::time::sleep(duration / 4).await;
    info!("demo: remote adjusts the camera");
    remote.set_zoom(0.5);
    remote.set_exposure(0.75);
    remote.set_flash_mode(FlashMode::On);
    remote.focus_at(0.5, 0.5);

    tokio::time::sleep(duration / 4).await;
    info!("demo: remote triggers a capture, operator flips the lens after");
    remote.capture_photo();
    camera.switch_lens();
    camera.focus_at(0.3, 0.7);
    camera.set_exposure(0.5);

    tokio::time::sleep(duration / 2).await;
    camera.set_flash_mode(FlashMode::Off);

    let quality = remote_conn.quality();
    let frames = frames_seen.load(Ordering::Relaxed);
    info!(
        frames,
        latency_ms = quality.latency_ms,
        level = ?quality.level(),
        "demo finished"
    );

    let camera_state = camera.camera_state().borrow().clone();
    let remote_state = remote.camera_state().borrow().clone();
    info!(
        camera_zoom = camera_state.zoom_ratio,
        remote_zoom = remote_state.zoom_ratio,
        zoom_progress = remote_state.zoom_progress(),
        exposure_progress = remote_state.exposure_progress(),
        aspect = remote_state.aspect_ratio.label(),
        "final state"
    );

    match remote.capture_confirmation().borrow().clone() {
        Some(report) if report.success => {
            info!(uri = ?report.photo_uri, "remote capture confirmed");
        }
        Some(report) => info!(error = ?report.error_message, "remote capture failed"),
        None => info!("no capture confirmation received"),
    }
    let camera_outcome = camera.last_capture().borrow().clone();
    debug!(
        ?camera_outcome,
        busy = *camera.is_capturing().borrow(),
        "camera-side capture record"
    );

    // Explicit single-peer disconnect, then teardown
    if let Some(peer) = remote_conn.peers().first() {
        remote_conn.disconnect(&peer.endpoint_id);
    }
    remote.stop();
    camera.stop();
    Ok(())
}

fn render_frame(output: &str) -> Result<()> {
    let state = protocol::CameraState::default();
    let frame = camera::synthetic::test_frame(&state, 0);
    let processed = camera::pipeline::process_frame(&frame).context("frame processing failed")?;
    std::fs::write(output, &processed.jpeg)
        .with_context(|| format!("failed to write {output}"))?;
    println!(
        "✅ Wrote {}x{} preview frame to {} ({} bytes)",
        processed.width,
        processed.height,
        output,
        processed.jpeg.len()
    );
    Ok(())
}
