//! Server wiring: shared state and thread lifecycle.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::acceptor::{acceptor_loop, CameraWireInfo};
use crate::calibration::Calibration;
use crate::camera_state::{CameraFeeds, CameraStreams};
use crate::error::Result;
use crate::fanout::{fanout_loop, Client};
use crate::notify::FrameNotifier;

/// State shared between the acceptor, the fan-out, and the owner.
pub struct ServerShared {
    /// Connected clients; held only for list appends and per-sub-stream
    /// broadcasts.
    pub clients: Mutex<Vec<Client>>,
    pub notifier: FrameNotifier,
    pub shutdown: AtomicBool,
}

/// One camera's contribution to the server: compression state, the
/// fan-out's consumer handles, and the calibration sent to clients.
pub struct CameraRig {
    pub streams: Arc<CameraStreams>,
    pub feeds: CameraFeeds,
    pub calibration: Calibration,
}

/// A running capture server: one listening thread plus one fan-out thread.
pub struct Server {
    shared: Arc<ServerShared>,
    acceptor: Option<JoinHandle<()>>,
    fanout: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Server {
    /// Start the listening and fan-out threads over an already-bound
    /// listener.
    pub fn start(listener: TcpListener, notifier: FrameNotifier, rigs: Vec<CameraRig>) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(ServerShared {
            clients: Mutex::new(Vec::new()),
            notifier,
            shutdown: AtomicBool::new(false),
        });

        let mut wire_info = Vec::with_capacity(rigs.len());
        let mut feeds = Vec::with_capacity(rigs.len());
        for rig in rigs {
            wire_info.push(CameraWireInfo {
                color_headers: rig.streams.color_headers().to_vec(),
                depth_headers: rig.streams.depth_headers().to_vec(),
                calibration: rig.calibration,
            });
            feeds.push(rig.feeds);
        }

        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("acceptor".into())
                .spawn(move || acceptor_loop(listener, shared, wire_info))?
        };
        // Without cameras there are no meta-frames to schedule; clients
        // still get the preamble and then silence.
        let fanout = if feeds.is_empty() {
            None
        } else {
            let shared = Arc::clone(&shared);
            Some(
                thread::Builder::new()
                    .name("fanout".into())
                    .spawn(move || fanout_loop(shared, feeds))?,
            )
        };

        info!(addr = %local_addr, "server started");
        Ok(Self {
            shared,
            acceptor: Some(acceptor),
            fanout,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// Stop the listening thread, then the fan-out thread. Join errors are
    /// logged and swallowed so shutdown always completes. Client sockets
    /// stay open until [`disconnect_clients`](Self::disconnect_clients),
    /// which the owner calls after its cameras have stopped.
    pub fn stop(&mut self) {
        self.shared
            .shutdown
            .store(true, std::sync::atomic::Ordering::Release);
        self.shared.notifier.notify();

        if let Some(handle) = self.acceptor.take() {
            if handle.join().is_err() {
                warn!("acceptor thread panicked during shutdown");
            }
        }
        if let Some(handle) = self.fanout.take() {
            if handle.join().is_err() {
                warn!("fan-out thread panicked during shutdown");
            }
        }
        info!("server stopped");
    }

    /// Drop every client socket.
    pub fn disconnect_clients(&self) {
        self.shared.clients.lock().clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.acceptor.is_some() || self.fanout.is_some() {
            self.stop();
        }
        self.disconnect_clients();
    }
}
