//! Driver for depth+color tele-immersion sensors.
//!
//! This crate drives the camera half of a 3D-video capture rig: it opens
//! the sensor over USB, streams its two isochronous endpoints, assembles
//! and decodes raw frames, and carries the stream codecs that the capture
//! server multiplexes onto the wire.
//!
//! # Architecture
//!
//! ## Device access
//! - [`UsbDevice`] — opened sensor with its streaming interface claimed
//! - [`Camera`] — mode selection, control protocol, streaming lifecycle
//!
//! ## Streaming
//! - one USB event thread per camera pumps libusb
//! - per stream, a fixed isochronous transfer ring assembles packets into
//!   recycled raw-frame buffers
//! - per stream, a decoder thread turns raw frames into [`FrameBuffer`]s
//!   and hands them to the caller's callback
//!
//! ## Image pipeline
//! - [`decode::bayer`] — GRBG demosaicing to RGB24
//! - [`decode::depth`] — 11-bit depth unpacking
//! - [`BackgroundModel`] — minimum-depth background learning and removal
//! - [`codec`] — color and depth stream compressors and their decoders
//!
//! ## Utilities
//! - [`triple_buffer`] — wait-free SPSC freshest-value handoff
//! - [`blob`] — eight-connected component labeling for calibration tooling
//!
//! # Example
//!
//! ```no_run
//! use teleview_camera::{Camera, FrameRate, Stream};
//!
//! # fn example() -> teleview_camera::Result<()> {
//! let context = rusb::Context::new().map_err(teleview_camera::CameraError::Usb)?;
//! let mut camera = Camera::open(&context, Some("A00366900123042A"))?;
//! camera.set_frame_rate(Stream::Color, FrameRate::Hz30)?;
//! camera.start_streaming(
//!     Box::new(|frame| println!("color frame at {:.3}s", frame.timestamp())),
//!     Box::new(|frame| println!("depth frame at {:.3}s", frame.timestamp())),
//! )?;
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! camera.stop_streaming()?;
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod blob;
pub mod camera;
pub mod codec;
pub mod decode;
pub mod error;
pub mod frame;
mod isochronous;
pub mod triple;
pub mod usb;

pub use background::{BackgroundCaptureCallback, BackgroundModel, INVALID_DEPTH};
pub use blob::{find_blobs, Accumulator, Blob, NoAccumulator};
pub use camera::{Camera, FrameRate, FrameSize, Stream, StreamingCallback};
pub use codec::{ColorCompressor, ColorDecompressor, DepthCompressor, DepthDecompressor, FrameSink};
pub use error::{CameraError, Result};
pub use frame::FrameBuffer;
pub use triple::{triple_buffer, TripleConsumer, TripleProducer};
pub use usb::{UsbDevice, PRODUCT_ID, VENDOR_ID};
