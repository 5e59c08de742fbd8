//! Decoded frame payloads shared between the driver and its consumers.

use bytes::Bytes;

/// A decoded color or depth frame.
///
/// The payload is reference counted: cloning a `FrameBuffer` is cheap and
/// never copies pixel data. Frames are immutable once a decoder has
/// published them, so one producer can hand the same frame to several
/// consumers without coordination.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixel_stride: usize,
    timestamp: f64,
    payload: Bytes,
}

impl FrameBuffer {
    /// Wrap a decoded pixel buffer.
    ///
    /// # Panics
    ///
    /// Panics if `payload.len() != width * height * pixel_stride`; decoders
    /// construct payloads from the dimensions, so a mismatch is a bug in the
    /// caller, not a runtime condition.
    pub fn new(
        width: u32,
        height: u32,
        pixel_stride: usize,
        timestamp: f64,
        payload: Bytes,
    ) -> Self {
        assert_eq!(
            payload.len(),
            width as usize * height as usize * pixel_stride,
            "frame payload does not match {}x{}x{}",
            width,
            height,
            pixel_stride
        );
        Self {
            width,
            height,
            pixel_stride,
            timestamp,
            payload,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per pixel of the payload.
    pub fn pixel_stride(&self) -> usize {
        self.pixel_stride
    }

    /// Capture time in seconds on the camera's frame timer.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as 16-bit values (depth frames store one `u16` per pixel
    /// in native byte order).
    pub fn iter_u16(&self) -> impl Iterator<Item = u16> + '_ {
        self.payload
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
    }
}
