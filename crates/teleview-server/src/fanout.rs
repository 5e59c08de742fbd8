//! Meta-frame fan-out scheduler.
//!
//! The scheduler drives one synchronization round ("meta-frame") at a
//! time: every camera must contribute exactly one color and one depth
//! frame to meta-frame `m` before any sub-stream of `m + 1` goes out.
//! Within a round, whichever sub-stream becomes ready first is sent first;
//! the per-camera `has_sent` flags and the two missing counters enforce the
//! exactly-once discipline.
//!
//! Broadcasts run under the client-list mutex. Every per-client write is
//! individually guarded: a failed or disconnecting client is removed on
//! the spot (index-based iteration, no propagation to other clients). A
//! slow client therefore throttles the whole server; that trade is
//! accepted for the strict ordering it buys.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::camera_state::{CameraFeeds, CompressedFrame};
use crate::server::ServerShared;

/// How long the scheduler sleeps on the new-frame condition before
/// re-checking for shutdown.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// One connected sink.
pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Client {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Zero-timeout readability probe: any pending client data is a
    /// disconnect request (a single `u32`, any value), EOF counts too.
    fn poll_disconnect(&mut self) -> std::io::Result<bool> {
        self.stream.set_nonblocking(true)?;
        let mut probe = [0u8; 4];
        let result = self.stream.peek(&mut probe);
        self.stream.set_nonblocking(false)?;
        match result {
            Ok(0) => Ok(true),
            Ok(_) => {
                // Consume the request before closing.
                let mut word = [0u8; 4];
                let _ = self.stream.read(&mut word);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write one frame record and push it to the kernel.
    fn send_record(
        &mut self,
        meta_frame_index: u32,
        stream_id: u32,
        payload: &[u8],
    ) -> std::io::Result<()> {
        self.stream.write_all(&meta_frame_index.to_ne_bytes())?;
        self.stream.write_all(&stream_id.to_ne_bytes())?;
        self.stream.write_all(payload)?;
        self.stream.flush()
    }
}

struct CameraFanState {
    feeds: CameraFeeds,
    has_sent_color: bool,
    has_sent_depth: bool,
}

/// Scheduler thread body. Runs until the shared shutdown flag is set.
pub(crate) fn fanout_loop(shared: Arc<ServerShared>, feeds: Vec<CameraFeeds>) {
    let mut cameras: Vec<CameraFanState> = feeds
        .into_iter()
        .map(|feeds| CameraFanState {
            feeds,
            has_sent_color: false,
            has_sent_depth: false,
        })
        .collect();
    let mut meta_frame_index: u32 = 0;
    let mut seen_generation = shared.notifier.generation();

    info!(cameras = cameras.len(), "fan-out scheduler running");

    'run: loop {
        let mut num_missing_color = cameras.len();
        let mut num_missing_depth = cameras.len();
        for camera in cameras.iter_mut() {
            camera.has_sent_color = false;
            camera.has_sent_depth = false;
        }

        while num_missing_color > 0 || num_missing_depth > 0 {
            if shared.shutdown.load(Ordering::Acquire) {
                break 'run;
            }

            // Probe cameras in index order; any hit restarts the scan so
            // camera 0 is always tried first.
            let mut progress = false;
            'scan: for i in 0..cameras.len() {
                if !cameras[i].has_sent_color && cameras[i].feeds.color.refresh() {
                    let frame = cameras[i].feeds.color.read();
                    trace!(
                        meta_frame_index,
                        camera = i,
                        frame_index = frame.index,
                        "broadcasting color frame"
                    );
                    broadcast(&shared, meta_frame_index, i as u32 * 2, frame);
                    cameras[i].has_sent_color = true;
                    num_missing_color -= 1;
                    progress = true;
                    break 'scan;
                }
                if !cameras[i].has_sent_depth && cameras[i].feeds.depth.refresh() {
                    let frame = cameras[i].feeds.depth.read();
                    trace!(
                        meta_frame_index,
                        camera = i,
                        frame_index = frame.index,
                        "broadcasting depth frame"
                    );
                    broadcast(&shared, meta_frame_index, i as u32 * 2 + 1, frame);
                    cameras[i].has_sent_depth = true;
                    num_missing_depth -= 1;
                    progress = true;
                    break 'scan;
                }
            }

            if !progress {
                seen_generation = shared.notifier.wait_beyond(seen_generation, WAIT_SLICE);
            }
        }

        meta_frame_index = meta_frame_index.wrapping_add(1);
    }

    debug!("fan-out scheduler exiting");
}

/// Send one sub-stream frame to every connected client, disconnecting the
/// ones that fail or asked to leave.
fn broadcast(
    shared: &ServerShared,
    meta_frame_index: u32,
    stream_id: u32,
    frame: &CompressedFrame,
) {
    let mut clients = shared.clients.lock();
    let mut i = 0;
    while i < clients.len() {
        let drop_client = match clients[i].poll_disconnect() {
            Ok(true) => {
                info!(peer = %clients[i].peer(), "client requested disconnect");
                true
            }
            Ok(false) => match clients[i].send_record(meta_frame_index, stream_id, &frame.data) {
                Ok(()) => false,
                Err(e) => {
                    warn!(peer = %clients[i].peer(), error = %e, "dropping client after write error");
                    true
                }
            },
            Err(e) => {
                warn!(peer = %clients[i].peer(), error = %e, "dropping client after probe error");
                true
            }
        };
        if drop_client {
            clients.remove(i);
        } else {
            i += 1;
        }
    }
}
