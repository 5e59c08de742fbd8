//! Listening acceptor.
//!
//! Accepts TCP connections, sends each new client the connection preamble
//! (magic word, camera count, per-camera stream headers and calibration),
//! and appends it to the shared client list. The acceptor never touches
//! per-frame traffic; any error before the list append just closes that
//! socket and keeps accepting.

use std::io::{BufWriter, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::calibration::Calibration;
use crate::fanout::Client;
use crate::server::ServerShared;

/// First word of every connection.
pub const PROTOCOL_MAGIC: u32 = 0x1234_5678;

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Everything a new client must receive about one camera.
pub(crate) struct CameraWireInfo {
    pub color_headers: Vec<u8>,
    pub depth_headers: Vec<u8>,
    pub calibration: Calibration,
}

/// Acceptor thread body. Runs until the shared shutdown flag is set.
pub(crate) fn acceptor_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    cameras: Vec<CameraWireInfo>,
) {
    if let Err(e) = listener.set_nonblocking(true) {
        error!(error = %e, "cannot poll the listening socket; acceptor exiting");
        return;
    }
    info!(addr = ?listener.local_addr().ok(), "listening for clients");

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            debug!("acceptor exiting");
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => match initialize_client(stream, peer, &cameras) {
                Ok(client) => {
                    info!(%peer, "client connected");
                    shared.clients.lock().push(client);
                }
                Err(e) => {
                    warn!(%peer, error = %e, "dropping client that failed the preamble");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Send the preamble and wrap the socket into a [`Client`].
fn initialize_client(
    stream: TcpStream,
    peer: SocketAddr,
    cameras: &[CameraWireInfo],
) -> std::io::Result<Client> {
    // The accepted socket must block for the streaming writes.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let mut writer = BufWriter::new(&stream);
    write_preamble(&mut writer, cameras)?;
    writer.flush()?;
    drop(writer);

    Ok(Client::new(stream, peer))
}

/// Connection preamble: magic, camera count, then per camera the color and
/// depth stream headers followed by the calibration block.
pub(crate) fn write_preamble<W: Write>(
    writer: &mut W,
    cameras: &[CameraWireInfo],
) -> std::io::Result<()> {
    writer.write_all(&PROTOCOL_MAGIC.to_ne_bytes())?;
    writer.write_all(&(cameras.len() as u32).to_ne_bytes())?;
    for camera in cameras {
        writer.write_all(&camera.color_headers)?;
        writer.write_all(&camera.depth_headers)?;
        camera.calibration.write_to(writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_layout() {
        let cameras = vec![CameraWireInfo {
            color_headers: vec![1, 2, 3],
            depth_headers: vec![4, 5],
            calibration: Calibration::default(),
        }];
        let mut bytes = Vec::new();
        write_preamble(&mut bytes, &cameras).unwrap();

        assert_eq!(
            u32::from_ne_bytes(bytes[0..4].try_into().unwrap()),
            PROTOCOL_MAGIC
        );
        assert_eq!(u32::from_ne_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(&bytes[8..11], &[1, 2, 3]);
        assert_eq!(&bytes[11..13], &[4, 5]);
        assert_eq!(bytes.len(), 13 + Calibration::WIRE_SIZE);
    }

    #[test]
    fn preamble_with_no_cameras_is_just_the_header() {
        let mut bytes = Vec::new();
        write_preamble(&mut bytes, &[]).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(u32::from_ne_bytes(bytes[4..8].try_into().unwrap()), 0);
    }
}
