//! Per-camera compression glue.
//!
//! [`CameraStreams`] sits between a camera's decoder threads and the
//! fan-out: the streaming callbacks feed decoded frames into the
//! compressors, move the compressed bytes into a triple-buffer slot, and
//! poke the shared new-frame condition. The fan-out holds the matching
//! [`CameraFeeds`] consumer handles and only ever sees whole compressed
//! frames.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use teleview_camera::{
    triple_buffer, ColorCompressor, DepthCompressor, FrameBuffer, FrameSink, StreamingCallback,
    TripleConsumer, TripleProducer,
};

use crate::notify::FrameNotifier;

/// Initial capacity of each compressor's backing buffer.
const SINK_CAPACITY: usize = 16384;

/// One compressed, time-stamped frame ready for the wire.
#[derive(Debug, Clone, Default)]
pub struct CompressedFrame {
    /// Per-stream frame counter.
    pub index: u32,
    /// Capture timestamp in seconds.
    pub timestamp: f64,
    /// Self-describing codec payload.
    pub data: Vec<u8>,
}

struct ColorLane {
    compressor: ColorCompressor,
    sink: FrameSink,
    producer: TripleProducer<CompressedFrame>,
    frame_index: u32,
}

struct DepthLane {
    compressor: DepthCompressor,
    sink: FrameSink,
    producer: TripleProducer<CompressedFrame>,
    frame_index: u32,
}

/// Consumer ends of one camera's compressed streams, owned by the fan-out.
pub struct CameraFeeds {
    pub color: TripleConsumer<CompressedFrame>,
    pub depth: TripleConsumer<CompressedFrame>,
}

/// Compression state for one camera.
pub struct CameraStreams {
    color: Mutex<ColorLane>,
    depth: Mutex<DepthLane>,
    color_headers: Vec<u8>,
    depth_headers: Vec<u8>,
    notifier: FrameNotifier,
}

impl CameraStreams {
    /// Build the compressors for the given stream geometries and capture
    /// their stream headers.
    pub fn new(
        color_size: (u32, u32),
        depth_size: (u32, u32),
        notifier: FrameNotifier,
    ) -> (Arc<Self>, CameraFeeds) {
        let mut color_sink = FrameSink::with_capacity(SINK_CAPACITY);
        let color_compressor = ColorCompressor::new(&mut color_sink, color_size.0, color_size.1);
        let mut color_headers = Vec::new();
        color_sink.store_buffers(&mut color_headers);

        let mut depth_sink = FrameSink::with_capacity(SINK_CAPACITY);
        let depth_compressor = DepthCompressor::new(&mut depth_sink, depth_size.0, depth_size.1);
        let mut depth_headers = Vec::new();
        depth_sink.store_buffers(&mut depth_headers);

        let (color_producer, color_consumer) = triple_buffer(CompressedFrame::default());
        let (depth_producer, depth_consumer) = triple_buffer(CompressedFrame::default());

        let streams = Arc::new(Self {
            color: Mutex::new(ColorLane {
                compressor: color_compressor,
                sink: color_sink,
                producer: color_producer,
                frame_index: 0,
            }),
            depth: Mutex::new(DepthLane {
                compressor: depth_compressor,
                sink: depth_sink,
                producer: depth_producer,
                frame_index: 0,
            }),
            color_headers,
            depth_headers,
            notifier,
        });
        (
            streams,
            CameraFeeds {
                color: color_consumer,
                depth: depth_consumer,
            },
        )
    }

    /// Stream header bytes every new client must receive before frames.
    pub fn color_headers(&self) -> &[u8] {
        &self.color_headers
    }

    pub fn depth_headers(&self) -> &[u8] {
        &self.depth_headers
    }

    /// Compress and publish one decoded color frame.
    pub fn handle_color_frame(&self, frame: &FrameBuffer) {
        {
            let mut guard = self.color.lock();
            let lane = &mut *guard;
            if let Err(e) = lane.compressor.write_frame(&mut lane.sink, frame) {
                warn!(error = %e, "color frame rejected by compressor");
                return;
            }
            let slot = lane.producer.input();
            slot.index = lane.frame_index;
            slot.timestamp = frame.timestamp();
            lane.sink.store_buffers(&mut slot.data);
            lane.producer.publish();
            lane.frame_index += 1;
        }
        self.notifier.notify();
    }

    /// Compress and publish one decoded depth frame.
    pub fn handle_depth_frame(&self, frame: &FrameBuffer) {
        {
            let mut guard = self.depth.lock();
            let lane = &mut *guard;
            if let Err(e) = lane.compressor.write_frame(&mut lane.sink, frame) {
                warn!(error = %e, "depth frame rejected by compressor");
                return;
            }
            let slot = lane.producer.input();
            slot.index = lane.frame_index;
            slot.timestamp = frame.timestamp();
            lane.sink.store_buffers(&mut slot.data);
            lane.producer.publish();
            lane.frame_index += 1;
        }
        self.notifier.notify();
    }

    /// Callbacks to install on the camera's decoder threads.
    pub fn streaming_callbacks(self: &Arc<Self>) -> (StreamingCallback, StreamingCallback) {
        let color = {
            let streams = Arc::clone(self);
            Box::new(move |frame: FrameBuffer| streams.handle_color_frame(&frame))
                as StreamingCallback
        };
        let depth = {
            let streams = Arc::clone(self);
            Box::new(move |frame: FrameBuffer| streams.handle_depth_frame(&frame))
                as StreamingCallback
        };
        (color, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn color_frame(timestamp: f64) -> FrameBuffer {
        FrameBuffer::new(4, 2, 3, timestamp, Bytes::from(vec![10u8; 24]))
    }

    fn depth_frame(timestamp: f64) -> FrameBuffer {
        let mut bytes = Vec::new();
        for v in [1u16, 2, 3, 4, 5, 6, 7, 8] {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        FrameBuffer::new(4, 2, 2, timestamp, Bytes::from(bytes))
    }

    #[test]
    fn headers_are_captured_at_construction() {
        let (streams, _feeds) = CameraStreams::new((4, 2), (4, 2), FrameNotifier::new());
        assert_eq!(streams.color_headers().len(), 12);
        assert_eq!(streams.depth_headers().len(), 12);
    }

    #[test]
    fn callbacks_publish_compressed_frames_and_signal() {
        let notifier = FrameNotifier::new();
        let (streams, mut feeds) = CameraStreams::new((4, 2), (4, 2), notifier.clone());
        let baseline = notifier.generation();

        streams.handle_color_frame(&color_frame(1.25));
        streams.handle_depth_frame(&depth_frame(1.26));
        assert_eq!(notifier.generation(), baseline + 2);

        assert!(feeds.color.refresh());
        let frame = feeds.color.read();
        assert_eq!(frame.index, 0);
        assert_eq!(frame.timestamp, 1.25);
        assert!(!frame.data.is_empty());

        assert!(feeds.depth.refresh());
        assert_eq!(feeds.depth.read().timestamp, 1.26);
    }

    #[test]
    fn frame_indices_increment_per_stream() {
        let (streams, mut feeds) = CameraStreams::new((4, 2), (4, 2), FrameNotifier::new());
        for i in 0..3 {
            streams.handle_color_frame(&color_frame(i as f64));
        }
        assert!(feeds.color.refresh());
        // The triple buffer keeps only the freshest frame.
        assert_eq!(feeds.color.read().index, 2);
    }
}
