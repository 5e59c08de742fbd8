//! Pixel-pipeline round-trip laws.
//!
//! The depth path must be exactly lossless end to end: sensor packing,
//! unpacking, background masking, wire compression, and client decoding
//! all preserve the 11-bit map bit for bit. The color wire codec is
//! lossless over decoded RGB frames.

use bytes::Bytes;

use teleview_camera::codec::depth as depth_codec;
use teleview_camera::decode::depth::{pack_11bit, unpack_11bit};
use teleview_camera::{
    BackgroundModel, ColorCompressor, ColorDecompressor, DepthCompressor, DepthDecompressor,
    FrameBuffer, FrameSink, INVALID_DEPTH,
};

const WIDTH: usize = 64;
const HEIGHT: usize = 16;

fn synthetic_depth(seed: u16) -> Vec<u16> {
    (0..WIDTH * HEIGHT)
        .map(|i| match i % 11 {
            0 => INVALID_DEPTH,
            j => ((seed as usize + i * j) % 0x7ff) as u16,
        })
        .collect()
}

#[test]
fn depth_path_is_lossless_from_sensor_to_client() {
    let map = synthetic_depth(700);

    // Sensor packing -> driver unpacking.
    let packed = pack_11bit(&map);
    let mut unpacked = vec![0u16; WIDTH * HEIGHT];
    unpack_11bit(&packed, &mut unpacked).unwrap();
    assert_eq!(unpacked, map);

    // Wire compression -> client decoding.
    let mut sink = FrameSink::default();
    let mut compressor = DepthCompressor::new(&mut sink, WIDTH as u32, HEIGHT as u32);
    sink.store_buffers(&mut Vec::new());

    let mut bytes = Vec::with_capacity(map.len() * 2);
    for &v in &unpacked {
        bytes.extend_from_slice(&v.to_ne_bytes());
    }
    let frame = FrameBuffer::new(WIDTH as u32, HEIGHT as u32, 2, 0.1, Bytes::from(bytes));
    compressor.write_frame(&mut sink, &frame).unwrap();

    let mut record = Vec::new();
    sink.store_buffers(&mut record);
    let length = u32::from_ne_bytes(record[0..4].try_into().unwrap()) as usize;
    assert_eq!(record.len(), 4 + length);

    let decoded = DepthDecompressor::new(WIDTH as u32, HEIGHT as u32)
        .decode_frame(&record[4..])
        .unwrap();
    assert_eq!(decoded, map);
}

#[test]
fn sensor_rle_stream_decodes_like_the_wire_codec() {
    // The sensor's compressed depth mode and the wire codec share one
    // format; a stream produced by the encoder must decode through the
    // driver's path.
    let map = synthetic_depth(123);
    let mut coded = Vec::new();
    depth_codec::compress(&map, WIDTH, HEIGHT, &mut coded);

    let mut out = vec![0u16; WIDTH * HEIGHT];
    depth_codec::decompress(&coded, WIDTH, HEIGHT, &mut out).unwrap();
    assert_eq!(out, map);
}

#[test]
fn background_masking_composes_with_the_codec() {
    let mut model = BackgroundModel::new(WIDTH, HEIGHT);
    model.start_capture(1, true, None);
    model.absorb(&vec![1000u16; WIDTH * HEIGHT]);
    model.set_remove(true);

    let mut map: Vec<u16> = (0..WIDTH * HEIGHT)
        .map(|i| if i % 2 == 0 { 950 } else { 1050 })
        .collect();
    model.filter(&mut map);
    for (i, &v) in map.iter().enumerate() {
        if i % 2 == 0 {
            assert_eq!(v, 950);
        } else {
            assert_eq!(v, INVALID_DEPTH);
        }
    }

    // Masked maps still round-trip exactly.
    let mut coded = Vec::new();
    depth_codec::compress(&map, WIDTH, HEIGHT, &mut coded);
    let mut out = vec![0u16; WIDTH * HEIGHT];
    depth_codec::decompress(&coded, WIDTH, HEIGHT, &mut out).unwrap();
    assert_eq!(out, map);
}

#[test]
fn color_stream_is_lossless_across_frames() {
    let mut sink = FrameSink::default();
    let mut compressor = ColorCompressor::new(&mut sink, WIDTH as u32, HEIGHT as u32);
    sink.store_buffers(&mut Vec::new());
    let mut decoder = ColorDecompressor::new(WIDTH as u32, HEIGHT as u32);

    for n in 0u32..5 {
        let pixels: Vec<u8> = (0..WIDTH * HEIGHT * 3)
            .map(|i| ((i as u32 * 7 + n * 13) % 256) as u8)
            .collect();
        let frame = FrameBuffer::new(
            WIDTH as u32,
            HEIGHT as u32,
            3,
            f64::from(n) / 30.0,
            Bytes::from(pixels.clone()),
        );
        compressor.write_frame(&mut sink, &frame).unwrap();

        let mut record = Vec::new();
        sink.store_buffers(&mut record);
        let length = u32::from_ne_bytes(record[0..4].try_into().unwrap()) as usize;
        assert_eq!(record.len(), 4 + length);
        assert_eq!(decoder.decode_frame(&record[4..]).unwrap(), pixels);
    }
}
