//! Camera driver: vendor control protocol and streaming lifecycle.
//!
//! A [`Camera`] wraps an opened [`UsbDevice`] and drives the sensor's two
//! image streams. Mode selection (frame size, rate, depth compression)
//! happens over the vendor control protocol while the streams are off;
//! [`Camera::start_streaming`] then brings up one USB event thread, two
//! isochronous transfer rings, and two decoder threads. Decoded frames are
//! delivered through caller-supplied callbacks on the decoder threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusb::Context;
use tracing::{debug, info, warn};

use crate::background::{BackgroundCaptureCallback, BackgroundModel};
use crate::codec;
use crate::decode::{bayer, depth};
use crate::error::{CameraError, Result};
use crate::frame::FrameBuffer;
use crate::isochronous::{FrameClock, IsoConfig, StreamShared, TransferRing};
use crate::usb::UsbDevice;

/// The two image streams of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Color = 0,
    Depth = 1,
}

impl Stream {
    fn index(self) -> usize {
        self as usize
    }
}

/// Selectable frame sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    /// 640x480.
    Vga,
    /// 1280x1024; color only, and only at 15 Hz.
    Sxga,
}

impl FrameSize {
    pub fn dims(self) -> (u32, u32) {
        match self {
            Self::Vga => (640, 480),
            Self::Sxga => (1280, 1024),
        }
    }
}

/// Selectable frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRate {
    Hz15,
    Hz30,
}

impl FrameRate {
    pub fn hz(self) -> u32 {
        match self {
            Self::Hz15 => 15,
            Self::Hz30 => 30,
        }
    }
}

/// Callback delivering decoded frames; invoked on a decoder thread.
pub type StreamingCallback = Box<dyn FnMut(FrameBuffer) + Send>;

// Control protocol framing.
const MSG_MAGIC_COMMAND: u16 = 0x4d47;
const MSG_MAGIC_REPLY: u16 = 0x4252;
const MSG_WRITE_REGISTER: u16 = 0x0003;
/// 1 ms polls tolerated before a control reply is declared lost.
const REPLY_POLL_LIMIT: u32 = 200;

// Camera registers and their values.
const REG_COLOR_STREAMING: u16 = 0x05;
const REG_COLOR_FORMAT: u16 = 0x0c;
const REG_COLOR_RESOLUTION: u16 = 0x0d;
const REG_COLOR_FPS: u16 = 0x0e;
const REG_DEPTH_STREAMING: u16 = 0x06;
const REG_DEPTH_FORMAT: u16 = 0x12;
const REG_DEPTH_RESOLUTION: u16 = 0x13;
const REG_DEPTH_FPS: u16 = 0x14;

const COLOR_FORMAT_BAYER: u16 = 0x00;
const RESOLUTION_VGA: u16 = 0x01;
const RESOLUTION_SXGA: u16 = 0x02;
const DEPTH_FORMAT_RLE: u16 = 0x02;
const DEPTH_FORMAT_11BIT: u16 = 0x03;
const STREAM_OFF: u16 = 0x00;
const COLOR_STREAM_ON: u16 = 0x01;
const DEPTH_STREAM_ON: u16 = 0x02;

// Isochronous stream geometry.
const ENDPOINT_COLOR: u8 = 0x81;
const ENDPOINT_DEPTH: u8 = 0x82;
const PACKET_SIZE_COLOR: usize = 1920;
const PACKET_SIZE_DEPTH: usize = 1760;
const FLAG_BASE_COLOR: u8 = 0x80;
const FLAG_BASE_DEPTH: u8 = 0x70;

/// The depth stream is fixed at VGA.
const DEPTH_DIMS: (u32, u32) = (640, 480);

struct StreamWorker {
    shared: Arc<StreamShared>,
    ring: TransferRing,
    decoder: Option<JoinHandle<()>>,
}

struct StreamingEngine {
    color: StreamWorker,
    depth: StreamWorker,
    event_running: Arc<AtomicBool>,
    event_thread: Option<JoinHandle<()>>,
}

/// Driver for one sensor.
pub struct Camera {
    device: UsbDevice,
    frame_sizes: [FrameSize; 2],
    frame_rates: [FrameRate; 2],
    compress_depth: bool,
    message_seq: u16,
    timer_epoch: Instant,
    frame_timer_offset: f64,
    background: Arc<Mutex<BackgroundModel>>,
    engine: Option<StreamingEngine>,
}

impl Camera {
    /// Open the camera with the given serial number, or any camera when
    /// `serial` is `None`.
    pub fn open(context: &Context, serial: Option<&str>) -> Result<Self> {
        let device = UsbDevice::open(context, serial)?;
        let (width, height) = DEPTH_DIMS;
        Ok(Self {
            device,
            frame_sizes: [FrameSize::Vga, FrameSize::Vga],
            frame_rates: [FrameRate::Hz30, FrameRate::Hz30],
            compress_depth: false,
            message_seq: 0,
            timer_epoch: Instant::now(),
            frame_timer_offset: 0.0,
            background: Arc::new(Mutex::new(BackgroundModel::new(
                width as usize,
                height as usize,
            ))),
            engine: None,
        })
    }

    pub fn serial(&self) -> &str {
        self.device.serial()
    }

    pub fn is_streaming(&self) -> bool {
        self.engine.is_some()
    }

    pub fn frame_size(&self, stream: Stream) -> FrameSize {
        self.frame_sizes[stream.index()]
    }

    /// Selected frame size in pixels.
    pub fn actual_frame_size(&self, stream: Stream) -> (u32, u32) {
        match stream {
            Stream::Color => self.frame_sizes[0].dims(),
            Stream::Depth => DEPTH_DIMS,
        }
    }

    pub fn frame_rate(&self, stream: Stream) -> FrameRate {
        self.frame_rates[stream.index()]
    }

    /// Selected frame rate in Hz.
    pub fn actual_frame_rate(&self, stream: Stream) -> u32 {
        self.frame_rates[stream.index()].hz()
    }

    /// Select the frame size for the next streaming session.
    pub fn set_frame_size(&mut self, stream: Stream, size: FrameSize) -> Result<()> {
        self.ensure_idle("set the frame size")?;
        if stream == Stream::Depth && size != FrameSize::Vga {
            return Err(CameraError::UnsupportedMode {
                message: "the depth stream only supports 640x480".into(),
            });
        }
        if stream == Stream::Color
            && size == FrameSize::Sxga
            && self.frame_rates[0] == FrameRate::Hz30
        {
            return Err(CameraError::UnsupportedMode {
                message: "1280x1024 color is only valid at 15 Hz".into(),
            });
        }
        self.frame_sizes[stream.index()] = size;
        Ok(())
    }

    /// Select the frame rate for the next streaming session.
    pub fn set_frame_rate(&mut self, stream: Stream, rate: FrameRate) -> Result<()> {
        self.ensure_idle("set the frame rate")?;
        if stream == Stream::Color
            && rate == FrameRate::Hz30
            && self.frame_sizes[0] == FrameSize::Sxga
        {
            return Err(CameraError::UnsupportedMode {
                message: "1280x1024 color is only valid at 15 Hz".into(),
            });
        }
        self.frame_rates[stream.index()] = rate;
        Ok(())
    }

    /// Request RLE/differential-compressed depth frames from the sensor for
    /// the next streaming session.
    pub fn set_compress_depth_frames(&mut self, compress: bool) -> Result<()> {
        self.ensure_idle("change depth compression")?;
        self.compress_depth = compress;
        Ok(())
    }

    /// Restart the frame timer at `offset` seconds.
    pub fn reset_frame_timer(&mut self, offset: f64) -> Result<()> {
        self.ensure_idle("reset the frame timer")?;
        self.timer_epoch = Instant::now();
        self.frame_timer_offset = offset;
        Ok(())
    }

    /// Capture `frames` depth frames into the background model; the
    /// optional callback fires once when done.
    pub fn capture_background(
        &self,
        frames: u32,
        replace: bool,
        on_complete: Option<BackgroundCaptureCallback>,
    ) {
        self.background
            .lock()
            .start_capture(frames, replace, on_complete);
    }

    /// Load a background from `<prefix>.background`.
    pub fn load_background(&self, prefix: &std::path::Path) -> Result<()> {
        self.background.lock().load(prefix)
    }

    /// Load a background from an already-open reader.
    pub fn load_background_from<R: std::io::Read>(&self, reader: &mut R, origin: &str) -> Result<()> {
        self.background.lock().load_from(reader, origin)
    }

    /// Save the current background to `<prefix>.background`.
    pub fn save_background(&self, prefix: &std::path::Path) -> Result<()> {
        self.background.lock().save(prefix)
    }

    /// Treat every pixel beyond `depth` as background.
    pub fn set_max_depth(&self, depth: u16, replace: bool) {
        self.background.lock().set_max_depth(depth, replace);
    }

    pub fn set_remove_background(&self, remove: bool) {
        self.background.lock().set_remove(remove);
    }

    pub fn remove_background(&self) -> bool {
        self.background.lock().remove_enabled()
    }

    pub fn set_background_removal_fuzz(&self, fuzz: i16) {
        self.background.lock().set_fuzz(fuzz);
    }

    pub fn background_removal_fuzz(&self) -> i16 {
        self.background.lock().fuzz()
    }

    /// Raw frames dropped by the assemblers in the current session.
    pub fn dropped_frames(&self, stream: Stream) -> u64 {
        match (&self.engine, stream) {
            (Some(engine), Stream::Color) => engine.color.ring.dropped_frames(),
            (Some(engine), Stream::Depth) => engine.depth.ring.dropped_frames(),
            (None, _) => 0,
        }
    }

    /// Negotiate the selected modes and start streaming both cameras.
    ///
    /// `color_callback` and `depth_callback` run on the decoder threads,
    /// one frame at a time per stream.
    pub fn start_streaming(
        &mut self,
        color_callback: StreamingCallback,
        depth_callback: StreamingCallback,
    ) -> Result<()> {
        if self.engine.is_some() {
            return Err(CameraError::invalid_state("already streaming"));
        }

        // Mode selection happens with both device streams off.
        self.command(REG_COLOR_STREAMING, STREAM_OFF)?;
        self.command(REG_DEPTH_STREAMING, STREAM_OFF)?;
        self.command(REG_COLOR_FORMAT, COLOR_FORMAT_BAYER)?;
        let color_resolution = match self.frame_sizes[0] {
            FrameSize::Vga => RESOLUTION_VGA,
            FrameSize::Sxga => RESOLUTION_SXGA,
        };
        self.command(REG_COLOR_RESOLUTION, color_resolution)?;
        self.command(REG_COLOR_FPS, self.frame_rates[0].hz() as u16)?;
        let depth_format = if self.compress_depth {
            DEPTH_FORMAT_RLE
        } else {
            DEPTH_FORMAT_11BIT
        };
        self.command(REG_DEPTH_FORMAT, depth_format)?;
        self.command(REG_DEPTH_RESOLUTION, RESOLUTION_VGA)?;
        self.command(REG_DEPTH_FPS, self.frame_rates[1].hz() as u16)?;

        let clock = Arc::new(FrameClock::new(self.timer_epoch, self.frame_timer_offset));

        let (color_width, color_height) = self.frame_sizes[0].dims();
        let color_raw = (color_width * color_height) as usize;
        let (depth_width, depth_height) = DEPTH_DIMS;
        let depth_pixels = (depth_width * depth_height) as usize;
        // The compressed stream is variable-length; size the buffer for the
        // worst case of one absolute token per pixel.
        let depth_raw = if self.compress_depth {
            depth_pixels * 2
        } else {
            (depth_pixels * 11 + 7) / 8
        };

        let color_shared = StreamShared::new(color_raw);
        let depth_shared = StreamShared::new(depth_raw);

        let color_ring = TransferRing::new(
            self.device.raw_handle(),
            &IsoConfig {
                endpoint: ENDPOINT_COLOR,
                packet_size: PACKET_SIZE_COLOR,
                flag_base: FLAG_BASE_COLOR,
                raw_frame_size: color_raw,
                exact: true,
            },
            Arc::clone(&clock),
            Arc::clone(&color_shared),
        )?;
        let depth_ring = TransferRing::new(
            self.device.raw_handle(),
            &IsoConfig {
                endpoint: ENDPOINT_DEPTH,
                packet_size: PACKET_SIZE_DEPTH,
                flag_base: FLAG_BASE_DEPTH,
                raw_frame_size: depth_raw,
                exact: !self.compress_depth,
            },
            clock,
            Arc::clone(&depth_shared),
        )?;

        // The event pump must run before submission so failures and
        // cancellations can resolve.
        let event_running = Arc::new(AtomicBool::new(true));
        let event_thread = {
            let context = self.device.context().clone();
            let running = Arc::clone(&event_running);
            thread::Builder::new()
                .name("usb-events".into())
                .spawn(move || event_loop(context, running))?
        };

        if let Err(e) = color_ring
            .submit_all()
            .and_then(|()| depth_ring.submit_all())
        {
            color_ring.cancel_all();
            depth_ring.cancel_all();
            drain_rings(&[&color_ring, &depth_ring]);
            event_running.store(false, Ordering::Release);
            let _ = event_thread.join();
            return Err(e);
        }

        let color_decoder = {
            let shared = Arc::clone(&color_shared);
            thread::Builder::new()
                .name("color-decode".into())
                .spawn(move || {
                    color_decoder_loop(shared, color_width, color_height, color_callback)
                })?
        };
        let depth_decoder = {
            let shared = Arc::clone(&depth_shared);
            let background = Arc::clone(&self.background);
            let compressed = self.compress_depth;
            thread::Builder::new()
                .name("depth-decode".into())
                .spawn(move || {
                    depth_decoder_loop(
                        shared,
                        depth_width,
                        depth_height,
                        compressed,
                        background,
                        depth_callback,
                    )
                })?
        };

        self.engine = Some(StreamingEngine {
            color: StreamWorker {
                shared: color_shared,
                ring: color_ring,
                decoder: Some(color_decoder),
            },
            depth: StreamWorker {
                shared: depth_shared,
                ring: depth_ring,
                decoder: Some(depth_decoder),
            },
            event_running,
            event_thread: Some(event_thread),
        });

        // Let the device talk.
        if let Err(e) = self
            .command(REG_COLOR_STREAMING, COLOR_STREAM_ON)
            .and_then(|()| self.command(REG_DEPTH_STREAMING, DEPTH_STREAM_ON))
        {
            let _ = self.stop_streaming();
            return Err(e);
        }

        info!(
            serial = %self.device.serial(),
            color = ?self.frame_sizes[0].dims(),
            rate = self.frame_rates[0].hz(),
            compressed_depth = self.compress_depth,
            "streaming started"
        );
        Ok(())
    }

    /// Stop streaming: cancel the transfer rings, wait for every transfer
    /// to resolve, join the decoder and event threads, and switch the
    /// device streams off. A no-op success when not streaming.
    pub fn stop_streaming(&mut self) -> Result<()> {
        let Some(mut engine) = self.engine.take() else {
            return Ok(());
        };
        debug!(serial = %self.device.serial(), "stopping streaming");

        engine.color.ring.cancel_all();
        engine.depth.ring.cancel_all();
        drain_rings(&[&engine.color.ring, &engine.depth.ring]);

        for worker in [&engine.color, &engine.depth] {
            worker.shared.cancel_decoding.store(true, Ordering::Release);
            worker.shared.wake();
        }
        for worker in [&mut engine.color, &mut engine.depth] {
            if let Some(handle) = worker.decoder.take() {
                if handle.join().is_err() {
                    warn!("decoder thread panicked during shutdown");
                }
            }
        }

        engine.event_running.store(false, Ordering::Release);
        if let Some(handle) = engine.event_thread.take() {
            if handle.join().is_err() {
                warn!("USB event thread panicked during shutdown");
            }
        }

        // Switch the device off; it may already be unplugged.
        for register in [REG_COLOR_STREAMING, REG_DEPTH_STREAMING] {
            if let Err(e) = self.command(register, STREAM_OFF) {
                debug!(error = %e, "stream-off command failed during shutdown");
            }
        }

        info!(serial = %self.device.serial(), "streaming stopped");
        Ok(())
    }

    fn ensure_idle(&self, what: &str) -> Result<()> {
        if self.engine.is_some() {
            return Err(CameraError::invalid_state(format!(
                "cannot {what} while streaming"
            )));
        }
        Ok(())
    }

    /// Send a general control message; returns the reply payload length.
    fn send_message(&mut self, message_type: u16, data: &[u16], reply: &mut [u8]) -> Result<usize> {
        let sequence = self.message_seq;
        self.message_seq = self.message_seq.wrapping_add(1);

        let mut message = Vec::with_capacity(8 + data.len() * 2);
        for word in [MSG_MAGIC_COMMAND, data.len() as u16, message_type, sequence] {
            message.extend_from_slice(&word.to_le_bytes());
        }
        for word in data {
            message.extend_from_slice(&word.to_le_bytes());
        }
        self.device.control_out(&message)?;

        // The device returns an empty reply until the message is processed.
        let mut raw = [0u8; 512];
        let mut polls = 0;
        let received = loop {
            let n = self.device.control_in(&mut raw)?;
            if n > 0 {
                break n;
            }
            polls += 1;
            if polls >= REPLY_POLL_LIMIT {
                return Err(CameraError::protocol("timed out waiting for control reply"));
            }
            thread::sleep(Duration::from_millis(1));
        };

        if received < 8 {
            return Err(CameraError::protocol(format!(
                "control reply of {received} bytes is shorter than its header"
            )));
        }
        let magic = u16::from_le_bytes([raw[0], raw[1]]);
        let length_words = u16::from_le_bytes([raw[2], raw[3]]) as usize;
        let reply_type = u16::from_le_bytes([raw[4], raw[5]]);
        let reply_seq = u16::from_le_bytes([raw[6], raw[7]]);
        if magic != MSG_MAGIC_REPLY {
            return Err(CameraError::protocol(format!(
                "control reply carries magic 0x{magic:04x}"
            )));
        }
        if reply_seq != sequence {
            return Err(CameraError::protocol(format!(
                "control reply sequence {reply_seq} does not match request {sequence}"
            )));
        }
        if reply_type != message_type {
            return Err(CameraError::protocol(format!(
                "control reply type 0x{reply_type:04x} does not match request 0x{message_type:04x}"
            )));
        }

        let payload = &raw[8..(8 + length_words * 2).min(received)];
        let copied = payload.len().min(reply.len());
        reply[..copied].copy_from_slice(&payload[..copied]);
        Ok(copied)
    }

    fn write_register(&mut self, register: u16, value: u16) -> Result<u16> {
        let mut reply = [0u8; 2];
        let n = self.send_message(MSG_WRITE_REGISTER, &[register, value], &mut reply)?;
        if n < 2 {
            return Err(CameraError::protocol("register write reply has no status word"));
        }
        Ok(u16::from_le_bytes(reply))
    }

    /// Write a register, treating a non-success status as an error.
    fn command(&mut self, register: u16, value: u16) -> Result<()> {
        let status = self.write_register(register, value)?;
        if status != 0 {
            return Err(CameraError::CommandRejected {
                command: register,
                value,
                status,
            });
        }
        Ok(())
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if self.engine.is_some() {
            if let Err(e) = self.stop_streaming() {
                warn!(error = %e, "error stopping streaming on drop");
            }
        }
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("serial", &self.device.serial())
            .field("streaming", &self.engine.is_some())
            .finish()
    }
}

/// Pump libusb events until told to stop.
fn event_loop(context: Context, running: Arc<AtomicBool>) {
    use rusb::UsbContext;
    while running.load(Ordering::Acquire) {
        if let Err(e) = context.handle_events(Some(Duration::from_millis(100))) {
            warn!(error = %e, "USB event loop error");
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Wait for cancelled rings to drain, bounded so shutdown always finishes.
fn drain_rings(rings: &[&TransferRing]) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let active: usize = rings.iter().map(|r| r.active_transfers()).sum();
        if active == 0 {
            return;
        }
        if Instant::now() >= deadline {
            warn!(active, "timed out waiting for transfers to resolve");
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn color_decoder_loop(
    shared: Arc<StreamShared>,
    width: u32,
    height: u32,
    mut callback: StreamingCallback,
) {
    while let Some(raw) = shared.wait_raw_frame() {
        if !raw.intact {
            debug!("discarding corrupt color frame");
            shared.recycle(raw.data);
            continue;
        }
        let rgb = bayer::demosaic_grbg(&raw.data[..raw.len], width as usize, height as usize);
        let timestamp = raw.timestamp;
        shared.recycle(raw.data);
        callback(FrameBuffer::new(width, height, 3, timestamp, rgb.into()));
    }
}

fn depth_decoder_loop(
    shared: Arc<StreamShared>,
    width: u32,
    height: u32,
    compressed: bool,
    background: Arc<Mutex<BackgroundModel>>,
    mut callback: StreamingCallback,
) {
    let pixels = (width * height) as usize;
    let mut map = vec![0u16; pixels];

    while let Some(raw) = shared.wait_raw_frame() {
        if !raw.intact {
            debug!("discarding corrupt depth frame");
            shared.recycle(raw.data);
            continue;
        }
        let decoded = if compressed {
            codec::depth::decompress(
                &raw.data[..raw.len],
                width as usize,
                height as usize,
                &mut map,
            )
        } else {
            depth::unpack_11bit(&raw.data[..raw.len], &mut map)
        };
        let timestamp = raw.timestamp;
        shared.recycle(raw.data);
        if let Err(e) = decoded {
            debug!(error = %e, "discarding undecodable depth frame");
            continue;
        }

        {
            let mut model = background.lock();
            if model.capturing() {
                model.absorb(&map);
            }
            model.filter(&mut map);
        }

        let mut bytes = Vec::with_capacity(pixels * 2);
        for &value in &map {
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
        callback(FrameBuffer::new(width, height, 2, timestamp, bytes.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_dims() {
        assert_eq!(FrameSize::Vga.dims(), (640, 480));
        assert_eq!(FrameSize::Sxga.dims(), (1280, 1024));
    }

    #[test]
    fn frame_rate_hz() {
        assert_eq!(FrameRate::Hz15.hz(), 15);
        assert_eq!(FrameRate::Hz30.hz(), 30);
    }
}
