//! Color stream codec: temporal byte-delta coding with run-length packing.
//!
//! Keyframes carry the RGB payload verbatim; delta frames carry the
//! byte-wise wrapping difference against the previous frame. Both are
//! packed with a zero-run scheme, which collapses the (mostly zero) delta
//! payloads of a static scene to a handful of bytes. Lossless end to end.

use crate::error::{CameraError, Result};
use crate::frame::FrameBuffer;

use super::{FrameSink, COLOR_CODEC_ID};

const FRAME_KEY: u8 = 0;
const FRAME_DELTA: u8 = 1;

/// Pack `src` as a sequence of `[zero_run: u8][literal_len: u8][literals]`
/// records.
pub fn pack(src: &[u8], out: &mut Vec<u8>) {
    let mut i = 0;
    while i < src.len() {
        let mut zeros = 0usize;
        while i + zeros < src.len() && src[i + zeros] == 0 && zeros < 255 {
            zeros += 1;
        }
        i += zeros;

        // Literals run to the next pair of zeros; a lone zero is cheaper
        // inline than as its own record.
        let mut literals = 0usize;
        while i + literals < src.len() && literals < 255 {
            let at = i + literals;
            if src[at] == 0 && src.get(at + 1).map_or(true, |&b| b == 0) {
                break;
            }
            literals += 1;
        }

        out.push(zeros as u8);
        out.push(literals as u8);
        out.extend_from_slice(&src[i..i + literals]);
        i += literals;
    }
}

/// Reverse of [`pack`]. The output must come out to exactly
/// `expected_len` bytes.
pub fn unpack(src: &[u8], expected_len: usize, out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    let mut i = 0;
    while i < src.len() {
        if i + 2 > src.len() {
            return Err(CameraError::decoding("truncated pack record"));
        }
        let zeros = src[i] as usize;
        let literals = src[i + 1] as usize;
        i += 2;
        if i + literals > src.len() {
            return Err(CameraError::decoding("pack record overruns payload"));
        }
        out.resize(out.len() + zeros, 0);
        out.extend_from_slice(&src[i..i + literals]);
        i += literals;
        if out.len() > expected_len {
            return Err(CameraError::decoding("packed data exceeds frame size"));
        }
    }
    if out.len() != expected_len {
        return Err(CameraError::decoding(format!(
            "packed data unpacked to {} of {} bytes",
            out.len(),
            expected_len
        )));
    }
    Ok(())
}

/// Color stream compressor.
pub struct ColorCompressor {
    width: u32,
    height: u32,
    previous: Vec<u8>,
    have_previous: bool,
    delta: Vec<u8>,
    packed: Vec<u8>,
}

impl ColorCompressor {
    pub fn new(sink: &mut FrameSink, width: u32, height: u32) -> Self {
        sink.write_u32(COLOR_CODEC_ID);
        sink.write_u32(width);
        sink.write_u32(height);
        let frame_bytes = width as usize * height as usize * 3;
        Self {
            width,
            height,
            previous: vec![0; frame_bytes],
            have_previous: false,
            delta: Vec::with_capacity(frame_bytes),
            packed: Vec::new(),
        }
    }

    pub fn write_frame(&mut self, sink: &mut FrameSink, frame: &FrameBuffer) -> Result<()> {
        if frame.width() != self.width || frame.height() != self.height || frame.pixel_stride() != 3
        {
            return Err(CameraError::decoding(format!(
                "color frame is {}x{}x{}, compressor expects {}x{}x3",
                frame.width(),
                frame.height(),
                frame.pixel_stride(),
                self.width,
                self.height
            )));
        }
        let payload = frame.payload();

        self.packed.clear();
        let frame_type = if self.have_previous {
            self.delta.clear();
            self.delta.extend(
                payload
                    .iter()
                    .zip(self.previous.iter())
                    .map(|(&cur, &prev)| cur.wrapping_sub(prev)),
            );
            pack(&self.delta, &mut self.packed);
            FRAME_DELTA
        } else {
            pack(payload, &mut self.packed);
            FRAME_KEY
        };

        self.previous.copy_from_slice(payload);
        self.have_previous = true;

        sink.write_u32(1 + self.packed.len() as u32);
        sink.write_bytes(&[frame_type]);
        sink.write_bytes(&self.packed);
        Ok(())
    }
}

/// Client-side decoder; also exercised by the round-trip tests.
pub struct ColorDecompressor {
    frame_bytes: usize,
    previous: Vec<u8>,
    have_previous: bool,
}

impl ColorDecompressor {
    pub fn new(width: u32, height: u32) -> Self {
        let frame_bytes = width as usize * height as usize * 3;
        Self {
            frame_bytes,
            previous: vec![0; frame_bytes],
            have_previous: false,
        }
    }

    pub fn decode_frame(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let (&frame_type, packed) = payload
            .split_first()
            .ok_or_else(|| CameraError::decoding("empty color payload"))?;

        let mut pixels = Vec::with_capacity(self.frame_bytes);
        unpack(packed, self.frame_bytes, &mut pixels)?;

        match frame_type {
            FRAME_KEY => {}
            FRAME_DELTA => {
                if !self.have_previous {
                    return Err(CameraError::decoding("delta frame without a keyframe"));
                }
                for (out, &prev) in pixels.iter_mut().zip(self.previous.iter()) {
                    *out = out.wrapping_add(prev);
                }
            }
            other => {
                return Err(CameraError::decoding(format!(
                    "unknown color frame type {other}"
                )))
            }
        }

        self.previous.copy_from_slice(&pixels);
        self.have_previous = true;
        Ok(pixels)
    }
}
