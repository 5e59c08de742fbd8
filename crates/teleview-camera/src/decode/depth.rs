//! Depth bitstream unpacking.
//!
//! The sensor packs 11 bits per pixel, most significant bit first within
//! each byte. Unpacking shifts bytes into an accumulator and peels 11 bits
//! per output pixel.

use crate::error::{CameraError, Result};

/// Unpack an 11-bit-per-pixel stream into `out`.
///
/// `input` must carry at least `ceil(out.len() * 11 / 8)` bytes; extra
/// trailing bytes are ignored.
pub fn unpack_11bit(input: &[u8], out: &mut [u16]) -> Result<()> {
    let needed = (out.len() * 11 + 7) / 8;
    if input.len() < needed {
        return Err(CameraError::decoding(format!(
            "11-bit stream is {} bytes, need {}",
            input.len(),
            needed
        )));
    }

    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut bytes = input.iter();
    for pixel in out.iter_mut() {
        while bits < 11 {
            acc = (acc << 8) | u32::from(*bytes.next().expect("length checked above"));
            bits += 8;
        }
        bits -= 11;
        *pixel = ((acc >> bits) & 0x7ff) as u16;
    }
    Ok(())
}

/// Inverse of [`unpack_11bit`]. Camera emulators and test fixtures use this
/// to synthesize raw depth streams.
pub fn pack_11bit(values: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity((values.len() * 11 + 7) / 8);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &v in values {
        acc = (acc << 11) | u32::from(v & 0x7ff);
        bits += 11;
        while bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    if bits > 0 {
        out.push((acc << (8 - bits)) as u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacks_known_pattern() {
        // 0x7ff, 0x000 -> bits 11111111111 00000000000 0...
        let packed = pack_11bit(&[0x7ff, 0]);
        assert_eq!(packed[0], 0xff);
        assert_eq!(packed[1], 0xe0);

        let mut out = [0u16; 2];
        unpack_11bit(&packed, &mut out).unwrap();
        assert_eq!(out, [0x7ff, 0]);
    }

    #[test]
    fn roundtrip_arbitrary_values() {
        let values: Vec<u16> = (0..640).map(|i| ((i * 37) % 0x800) as u16).collect();
        let packed = pack_11bit(&values);
        let mut out = vec![0u16; values.len()];
        unpack_11bit(&packed, &mut out).unwrap();
        assert_eq!(out, values);
    }

    #[test]
    fn short_stream_is_an_error() {
        let packed = pack_11bit(&[1, 2, 3]);
        let mut out = [0u16; 4];
        assert!(unpack_11bit(&packed, &mut out).is_err());
    }
}
