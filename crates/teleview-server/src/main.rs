//! Capture server binary.
//!
//! Loads the configuration, opens the configured cameras by serial number,
//! starts streaming into the per-camera compressors, and serves the
//! meta-frame stream on the configured port until stdin closes.

use std::io::BufRead;
use std::net::TcpListener;
use std::path::Path;

use anyhow::Context as _;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use teleview_camera::{Camera, Stream};
use teleview_server::{CameraRig, CameraStreams, FrameNotifier, Server, Settings};

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "teleview.toml".to_string());
    let settings = Settings::from_path(Path::new(&config_path))
        .with_context(|| format!("loading configuration from {config_path}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&settings.log_filter))
        .init();

    // A panic in any worker thread must take the process down rather than
    // leave a half-dead server behind.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(1);
    }));

    let context = rusb::Context::new().context("initializing libusb")?;
    let notifier = FrameNotifier::new();
    let mut cameras: Vec<Camera> = Vec::new();
    let mut rigs: Vec<CameraRig> = Vec::new();

    for name in &settings.cameras {
        let camera_settings = settings.camera_settings(name)?;
        let mut camera = match Camera::open(&context, Some(&camera_settings.serial_number)) {
            Ok(camera) => camera,
            Err(e) => {
                error!(camera = %name, serial = %camera_settings.serial_number, error = %e,
                    "camera not available; skipping");
                continue;
            }
        };

        if camera_settings.remove_background {
            if let Some(prefix) = &camera_settings.background_file {
                if let Err(e) = camera.load_background(prefix) {
                    warn!(camera = %name, error = %e, "could not load background file");
                }
            }
            if camera_settings.capture_background_frames > 0 {
                camera.capture_background(camera_settings.capture_background_frames, false, None);
            }
            if camera_settings.max_depth > 0 {
                camera.set_max_depth(camera_settings.max_depth as u16, false);
            }
            camera.set_background_removal_fuzz(camera_settings.background_fuzz as i16);
            camera.set_remove_background(true);
        }

        let (streams, feeds) = CameraStreams::new(
            camera.actual_frame_size(Stream::Color),
            camera.actual_frame_size(Stream::Depth),
            notifier.clone(),
        );
        let (color_callback, depth_callback) = streams.streaming_callbacks();
        camera
            .start_streaming(color_callback, depth_callback)
            .with_context(|| format!("starting streaming on camera '{name}'"))?;

        info!(camera = %name, serial = %camera.serial(), "camera streaming");
        rigs.push(CameraRig {
            streams,
            feeds,
            calibration: camera_settings.calibration.clone().unwrap_or_default(),
        });
        cameras.push(camera);
    }

    if cameras.is_empty() && !settings.cameras.is_empty() {
        anyhow::bail!("none of the configured cameras could be opened");
    }

    let listener = TcpListener::bind(("0.0.0.0", settings.listen_port_id))
        .with_context(|| format!("binding port {}", settings.listen_port_id))?;
    let mut server = Server::start(listener, notifier, rigs)?;
    info!(
        cameras = cameras.len(),
        port = settings.listen_port_id,
        "serving; close stdin to shut down"
    );

    // Block until stdin closes (Ctrl-D, or supervisor closing the pipe).
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "stdin error; shutting down");
                break;
            }
        }
    }

    // Shutdown order: listening thread, fan-out thread, cameras, clients.
    info!("shutting down");
    server.stop();
    for mut camera in cameras {
        if let Err(e) = camera.stop_streaming() {
            error!(serial = %camera.serial(), error = %e, "error stopping camera");
        }
    }
    server.disconnect_clients();
    Ok(())
}
