//! Tele-immersion capture server.
//!
//! The server side of the 3D-video pipeline: decoded camera frames are
//! compressed per stream, grouped into meta-frames (one color and one
//! depth frame per camera per round), and fanned out to every connected
//! TCP client in strict meta-frame order.
//!
//! # Structure
//!
//! - [`config`] — TOML settings and validation
//! - [`camera_state`] — per-camera compressors and triple-buffer handoff
//! - [`fanout`] — the meta-frame scheduler and client broadcasting
//! - [`acceptor`] — the listening thread and connection preamble
//! - [`calibration`] — per-camera transforms and their wire layout
//! - [`server`] — thread lifecycle around the above
//!
//! The binary in `main.rs` wires real cameras into a [`server::Server`];
//! the integration tests drive the same server with emulated cameras.

pub mod acceptor;
pub mod calibration;
pub mod camera_state;
pub mod config;
pub mod error;
pub mod fanout;
pub mod notify;
pub mod server;

pub use acceptor::PROTOCOL_MAGIC;
pub use calibration::{Calibration, Extrinsic};
pub use camera_state::{CameraFeeds, CameraStreams, CompressedFrame};
pub use config::{CameraSettings, Settings};
pub use error::{Result, ServerError};
pub use fanout::Client;
pub use notify::FrameNotifier;
pub use server::{CameraRig, Server, ServerShared};
