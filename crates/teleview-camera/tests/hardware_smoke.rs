//! Smoke tests against a physical sensor.
//!
//! These need a camera on the bus and are ignored by default:
//!
//! ```sh
//! cargo test -p teleview-camera --test hardware_smoke -- --ignored
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use teleview_camera::{Camera, Stream};

fn open_any() -> Camera {
    let context = rusb::Context::new().expect("libusb context");
    Camera::open(&context, None).expect("a camera on the bus")
}

#[test]
#[ignore = "requires a physical camera"]
fn streams_frames_from_both_cameras() {
    let mut camera = open_any();

    let color_frames = Arc::new(AtomicU32::new(0));
    let depth_frames = Arc::new(AtomicU32::new(0));
    let color_count = Arc::clone(&color_frames);
    let depth_count = Arc::clone(&depth_frames);

    camera
        .start_streaming(
            Box::new(move |_| {
                color_count.fetch_add(1, Ordering::Relaxed);
            }),
            Box::new(move |_| {
                depth_count.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .expect("start streaming");

    std::thread::sleep(Duration::from_secs(3));
    let color_dropped = camera.dropped_frames(Stream::Color);
    camera.stop_streaming().expect("stop streaming");

    // 3 s at 30 Hz should deliver dozens of frames even on a noisy bus.
    assert!(color_frames.load(Ordering::Relaxed) > 10);
    assert!(depth_frames.load(Ordering::Relaxed) > 10);
    assert!(color_dropped < 10, "dropped {color_dropped} color frames");
}

#[test]
#[ignore = "requires a physical camera"]
fn stop_streaming_is_idempotent() {
    let mut camera = open_any();
    assert!(!camera.is_streaming());
    camera.stop_streaming().expect("no-op stop succeeds");

    camera
        .start_streaming(Box::new(|_| {}), Box::new(|_| {}))
        .expect("start streaming");
    camera.stop_streaming().expect("first stop");
    camera.stop_streaming().expect("second stop is a no-op");
    assert!(!camera.is_streaming());
}
