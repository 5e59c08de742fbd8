//! Isochronous transfer ring and raw-frame assembly.
//!
//! Each stream keeps a fixed ring of isochronous transfers in flight; the
//! ring is sized to absorb a full frame's worth of packet bursts so a
//! scheduling hiccup never drops data. Completed transfers are resubmitted
//! from the callback, so the ring never shrinks until cancellation.
//!
//! The safe `rusb` API has no isochronous support, so submission goes
//! through the raw libusb FFI. The unsafe surface is kept to this module;
//! everything the callback touches lives in a [`RingState`] that outlives
//! every in-flight transfer.
//!
//! Frame assembly recycles a small set of pre-allocated buffers: one is
//! being filled, one may sit in the ready slot, one may be held by the
//! decoder thread. Nothing allocates per frame.

use std::os::raw::{c_int, c_uint, c_void};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rusb::ffi;
use tracing::{debug, trace, warn};

use crate::error::{CameraError, Result};

/// Number of in-flight isochronous transfers per stream.
pub(crate) const NUM_TRANSFERS: usize = 32;
/// Isochronous packets per transfer.
pub(crate) const PACKETS_PER_TRANSFER: usize = 16;
/// Bytes of per-packet header preceding the payload fragment.
pub(crate) const PACKET_HEADER_SIZE: usize = 12;

/// Offset of the flag byte within the packet header.
const FLAG_OFFSET: usize = 3;

/// Low-nibble flag values; the high nibble carries the stream tag.
const FLAG_START_OF_FRAME: u8 = 0x1;
const FLAG_END_OF_FRAME: u8 = 0x5;

/// Consecutive failed transfers tolerated before the stream is declared
/// dead.
const MAX_CONSECUTIVE_ERRORS: u64 = 8;

/// Free-running timer stamping frames at start-of-frame.
///
/// The offset is fixed for the duration of a streaming session; the owner
/// only rebuilds the clock while not streaming.
pub(crate) struct FrameClock {
    epoch: Instant,
    offset: f64,
}

impl FrameClock {
    pub fn new(epoch: Instant, offset: f64) -> Self {
        Self { epoch, offset }
    }

    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() + self.offset
    }
}

/// A completed raw frame handed from the assembler to a decoder.
pub(crate) struct RawFrame {
    pub data: Vec<u8>,
    /// Bytes actually written; equals the full frame size for fixed-size
    /// streams, and the coded length for the compressed depth stream.
    pub len: usize,
    pub timestamp: f64,
    /// False when any packet of the frame was lost, short, or overflowed.
    pub intact: bool,
}

/// The ready slot and buffer pool shared by assembler and decoder.
pub(crate) struct SlotState {
    pub ready: Option<RawFrame>,
    pub spares: Vec<Vec<u8>>,
}

/// Per-stream state shared between the USB callback, the decoder thread,
/// and the owning camera.
pub(crate) struct StreamShared {
    pub slot: Mutex<SlotState>,
    pub frame_ready: Condvar,
    pub cancel_decoding: AtomicBool,
    /// Set when the transfer ring gives up after repeated failures.
    pub failed: AtomicBool,
}

impl StreamShared {
    /// Allocate the stream's buffer set up front; the assembler immediately
    /// takes one buffer as its write target.
    pub fn new(raw_frame_size: usize) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(SlotState {
                ready: None,
                spares: (0..3).map(|_| vec![0u8; raw_frame_size]).collect(),
            }),
            frame_ready: Condvar::new(),
            cancel_decoding: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        })
    }

    /// Return a decoded frame's buffer to the pool.
    pub fn recycle(&self, buffer: Vec<u8>) {
        self.slot.lock().spares.push(buffer);
    }

    /// Block until a raw frame is ready. Returns `None` on cancellation or
    /// stream failure.
    pub fn wait_raw_frame(&self) -> Option<RawFrame> {
        let mut slot = self.slot.lock();
        loop {
            if self.cancel_decoding.load(Ordering::Acquire) || self.failed.load(Ordering::Acquire)
            {
                return None;
            }
            if let Some(frame) = slot.ready.take() {
                return Some(frame);
            }
            self.frame_ready.wait(&mut slot);
        }
    }

    /// Wake the decoder so it can observe a cancel or failure flag.
    pub fn wake(&self) {
        let _guard = self.slot.lock();
        self.frame_ready.notify_all();
    }
}

/// Assembles packet payload fragments into raw frames.
pub(crate) struct Assembler {
    flag_base: u8,
    frame_size: usize,
    /// Fixed-size stream: an intact frame must fill the buffer exactly.
    /// The compressed depth stream is variable-length and only requires a
    /// clean start-to-end packet sequence.
    exact: bool,
    active: Vec<u8>,
    write_pos: usize,
    in_frame: bool,
    corrupt: bool,
    timestamp: f64,
    clock: Arc<FrameClock>,
    shared: Arc<StreamShared>,
    dropped_frames: u64,
}

impl Assembler {
    pub fn new(
        flag_base: u8,
        frame_size: usize,
        exact: bool,
        clock: Arc<FrameClock>,
        shared: Arc<StreamShared>,
    ) -> Self {
        let active = shared
            .slot
            .lock()
            .spares
            .pop()
            .expect("fresh stream state always has spare buffers");
        Self {
            flag_base,
            frame_size,
            exact,
            active,
            write_pos: 0,
            in_frame: false,
            corrupt: false,
            timestamp: 0.0,
            clock,
            shared,
            dropped_frames: 0,
        }
    }

    /// Feed one isochronous packet (header included).
    pub fn handle_packet(&mut self, packet: &[u8]) {
        if packet.is_empty() {
            return;
        }
        if packet.len() < PACKET_HEADER_SIZE {
            if self.in_frame {
                self.corrupt = true;
            }
            return;
        }
        let flag = packet[FLAG_OFFSET];
        if flag & 0xf0 != self.flag_base {
            // Another stream's tag; not ours to assemble.
            return;
        }
        let kind = flag & 0x0f;
        let payload = &packet[PACKET_HEADER_SIZE..];

        if kind == FLAG_START_OF_FRAME {
            if self.in_frame && self.write_pos > 0 {
                // The previous frame never saw its end packet.
                self.publish(false);
            }
            self.write_pos = 0;
            self.corrupt = false;
            self.in_frame = true;
            self.timestamp = self.clock.now();
        } else if !self.in_frame {
            // Mid-frame packets before the first start-of-frame.
            return;
        }

        let space = self.frame_size - self.write_pos;
        if payload.len() > space {
            self.active[self.write_pos..].copy_from_slice(&payload[..space]);
            self.write_pos = self.frame_size;
            self.corrupt = true;
        } else {
            self.active[self.write_pos..self.write_pos + payload.len()].copy_from_slice(payload);
            self.write_pos += payload.len();
        }

        if kind == FLAG_END_OF_FRAME {
            let intact = !self.corrupt && (!self.exact || self.write_pos == self.frame_size);
            self.publish(intact);
            self.in_frame = false;
        }
    }

    /// Mark the in-progress frame corrupt after a per-packet transfer
    /// error.
    pub fn note_packet_error(&mut self) {
        if self.in_frame {
            self.corrupt = true;
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Swap the filled buffer into the ready slot and continue assembling
    /// into a recycled one.
    fn publish(&mut self, intact: bool) {
        if !intact {
            self.dropped_frames += 1;
            trace!(
                written = self.write_pos,
                expected = self.frame_size,
                "assembled frame not intact"
            );
        }
        let mut slot = self.shared.slot.lock();
        let replacement = slot
            .spares
            .pop()
            // The decoder still holds a buffer and the ready slot is
            // occupied: overwrite the unread frame, keeping the freshest.
            .or_else(|| slot.ready.take().map(|stale| stale.data));
        let Some(replacement) = replacement else {
            // All buffers in flight; drop this frame in place.
            self.dropped_frames += 1;
            self.write_pos = 0;
            self.corrupt = false;
            return;
        };
        let filled = std::mem::replace(&mut self.active, replacement);
        let stale = slot.ready.replace(RawFrame {
            data: filled,
            len: self.write_pos,
            timestamp: self.timestamp,
            intact,
        });
        if let Some(stale) = stale {
            slot.spares.push(stale.data);
        }
        self.shared.frame_ready.notify_one();
        self.write_pos = 0;
        self.corrupt = false;
    }
}

/// Geometry of one stream's transfer ring.
pub(crate) struct IsoConfig {
    pub endpoint: u8,
    pub packet_size: usize,
    pub flag_base: u8,
    pub raw_frame_size: usize,
    pub exact: bool,
}

/// Everything the transfer callback touches. Boxed so its address is
/// stable for `user_data`.
struct RingState {
    assembler: Mutex<Assembler>,
    active_transfers: AtomicUsize,
    cancelling: AtomicBool,
    consecutive_errors: AtomicU64,
    packet_size: usize,
    shared: Arc<StreamShared>,
}

/// A ring of raw libusb isochronous transfers for one endpoint.
pub(crate) struct TransferRing {
    transfers: Vec<*mut ffi::libusb_transfer>,
    /// Transfer data buffers; kept alive for as long as the transfers are.
    buffers: Vec<Vec<u8>>,
    state: std::mem::ManuallyDrop<Box<RingState>>,
}

// SAFETY: the raw transfer pointers are only dereferenced by this module.
// The libusb event thread accesses them through the callback, which
// synchronizes on RingState's mutex and atomics; the owning thread only
// touches them for submit/cancel/free, which libusb permits from any
// thread.
unsafe impl Send for TransferRing {}

impl TransferRing {
    /// Allocate (but do not submit) a transfer ring on `handle`.
    pub fn new(
        handle: *mut ffi::libusb_device_handle,
        config: &IsoConfig,
        clock: Arc<FrameClock>,
        shared: Arc<StreamShared>,
    ) -> Result<Self> {
        let state = Box::new(RingState {
            assembler: Mutex::new(Assembler::new(
                config.flag_base,
                config.raw_frame_size,
                config.exact,
                clock,
                Arc::clone(&shared),
            )),
            active_transfers: AtomicUsize::new(0),
            cancelling: AtomicBool::new(false),
            consecutive_errors: AtomicU64::new(0),
            packet_size: config.packet_size,
            shared,
        });
        let state_ptr = &*state as *const RingState as *mut c_void;

        let buffer_len = config.packet_size * PACKETS_PER_TRANSFER;
        let mut transfers = Vec::with_capacity(NUM_TRANSFERS);
        let mut buffers = Vec::with_capacity(NUM_TRANSFERS);

        for _ in 0..NUM_TRANSFERS {
            let mut buffer = vec![0u8; buffer_len];
            // SAFETY: plain allocation call; a null return is checked.
            let transfer = unsafe { ffi::libusb_alloc_transfer(PACKETS_PER_TRANSFER as c_int) };
            if transfer.is_null() {
                // SAFETY: every pointer in `transfers` came from
                // libusb_alloc_transfer and was never submitted.
                for &t in &transfers {
                    unsafe { ffi::libusb_free_transfer(t) };
                }
                return Err(CameraError::Transport {
                    message: "failed to allocate isochronous transfer".into(),
                });
            }

            // SAFETY: `transfer` was just allocated with room for
            // PACKETS_PER_TRANSFER descriptors; `buffer` stays alive in
            // `buffers` for the life of the ring.
            unsafe {
                (*transfer).dev_handle = handle;
                (*transfer).endpoint = config.endpoint;
                (*transfer).transfer_type = ffi::constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
                (*transfer).timeout = 0;
                (*transfer).buffer = buffer.as_mut_ptr();
                (*transfer).length = buffer_len as c_int;
                (*transfer).num_iso_packets = PACKETS_PER_TRANSFER as c_int;
                (*transfer).callback = transfer_callback;
                (*transfer).user_data = state_ptr;
                let descriptors = iso_descriptors(transfer);
                for i in 0..PACKETS_PER_TRANSFER {
                    (*descriptors.add(i)).length = config.packet_size as c_uint;
                }
            }

            buffers.push(buffer);
            transfers.push(transfer);
        }

        Ok(Self {
            transfers,
            buffers,
            state: std::mem::ManuallyDrop::new(state),
        })
    }

    /// Submit every transfer in the ring. The libusb event loop must be
    /// running so that failures and completions can drain.
    pub fn submit_all(&self) -> Result<()> {
        for &transfer in &self.transfers {
            // SAFETY: the transfer is fully initialized and its buffer
            // outlives it.
            let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
            if rc != 0 {
                self.cancel_all();
                return Err(CameraError::Transport {
                    message: format!("failed to submit isochronous transfer (libusb error {rc})"),
                });
            }
            self.state.active_transfers.fetch_add(1, Ordering::AcqRel);
        }
        debug!(
            transfers = NUM_TRANSFERS,
            packets = PACKETS_PER_TRANSFER,
            packet_size = self.state.packet_size,
            "submitted transfer ring"
        );
        Ok(())
    }

    /// Request cancellation of all in-flight transfers. Completion is
    /// observed via [`active_transfers`](Self::active_transfers).
    pub fn cancel_all(&self) {
        self.state.cancelling.store(true, Ordering::Release);
        for &transfer in &self.transfers {
            // SAFETY: cancelling an idle or already-complete transfer is a
            // harmless NOT_FOUND.
            unsafe { ffi::libusb_cancel_transfer(transfer) };
        }
    }

    /// Number of transfers still owned by libusb.
    pub fn active_transfers(&self) -> usize {
        self.state.active_transfers.load(Ordering::Acquire)
    }

    /// Raw frames dropped by the assembler so far.
    pub fn dropped_frames(&self) -> u64 {
        self.state.assembler.lock().dropped_frames()
    }
}

impl Drop for TransferRing {
    fn drop(&mut self) {
        let active = self.active_transfers();
        if active > 0 {
            // Freeing an in-flight transfer would hand libusb dangling
            // memory; leak the ring (buffers and state included) instead
            // and complain loudly.
            warn!(active, "dropping transfer ring with transfers in flight; leaking");
            self.transfers.clear();
            std::mem::forget(std::mem::take(&mut self.buffers));
            return;
        }
        for &transfer in &self.transfers {
            // SAFETY: no transfer is in flight; the pointers came from
            // libusb_alloc_transfer.
            unsafe { ffi::libusb_free_transfer(transfer) };
        }
        // SAFETY: dropped exactly once, on the non-leaking path only.
        unsafe { std::mem::ManuallyDrop::drop(&mut self.state) };
    }
}

/// Pointer to the descriptor array trailing a transfer struct.
///
/// # Safety
///
/// `transfer` must point at a transfer allocated with at least as many
/// descriptors as are indexed.
unsafe fn iso_descriptors(
    transfer: *mut ffi::libusb_transfer,
) -> *mut ffi::libusb_iso_packet_descriptor {
    std::ptr::addr_of_mut!((*transfer).iso_packet_desc) as *mut ffi::libusb_iso_packet_descriptor
}

/// Completion callback, invoked on the libusb event thread.
extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data points at the RingState inside the owning
    // TransferRing, which is kept alive until every transfer has resolved.
    let state = unsafe { &*((*transfer).user_data as *const RingState) };
    // SAFETY: libusb hands us a valid transfer for the duration of the
    // callback.
    let status = unsafe { (*transfer).status };

    if status == ffi::constants::LIBUSB_TRANSFER_CANCELLED {
        state.active_transfers.fetch_sub(1, Ordering::AcqRel);
        return;
    }

    if status == ffi::constants::LIBUSB_TRANSFER_COMPLETED {
        state.consecutive_errors.store(0, Ordering::Relaxed);
        let mut assembler = state.assembler.lock();
        for i in 0..PACKETS_PER_TRANSFER {
            // SAFETY: equal-length packets are laid out back to back in the
            // transfer buffer; descriptor i covers the bytes at
            // i * packet_size.
            unsafe {
                let descriptor = &*iso_descriptors(transfer).add(i);
                if descriptor.status != 0 {
                    assembler.note_packet_error();
                    continue;
                }
                let length = descriptor.actual_length as usize;
                if length == 0 {
                    continue;
                }
                let base = (*transfer).buffer.add(i * state.packet_size);
                assembler.handle_packet(std::slice::from_raw_parts(base, length));
            }
        }
    } else {
        // Transport error. Cancellation aside, errors are survivable in
        // isolation; a run of them means the device is gone.
        let errors = state.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(status, errors, "isochronous transfer failed");
        if errors >= MAX_CONSECUTIVE_ERRORS
            || status == ffi::constants::LIBUSB_TRANSFER_NO_DEVICE
        {
            warn!(status, "transfer ring giving up; marking stream failed");
            state.shared.failed.store(true, Ordering::Release);
            state.shared.wake();
            state.active_transfers.fetch_sub(1, Ordering::AcqRel);
            return;
        }
    }

    if state.cancelling.load(Ordering::Acquire) {
        state.active_transfers.fetch_sub(1, Ordering::AcqRel);
        return;
    }

    // SAFETY: the transfer just resolved, so resubmitting it is valid.
    let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
    if rc != 0 {
        warn!(rc, "failed to resubmit isochronous transfer");
        state.shared.failed.store(true, Ordering::Release);
        state.shared.wake();
        state.active_transfers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_FLAG_BASE: u8 = 0x70;

    fn packet(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; PACKET_HEADER_SIZE];
        pkt[0] = b'R';
        pkt[1] = b'B';
        pkt[FLAG_OFFSET] = TEST_FLAG_BASE | kind;
        pkt.extend_from_slice(payload);
        pkt
    }

    fn assembler(frame_size: usize, exact: bool) -> (Assembler, Arc<StreamShared>) {
        let shared = StreamShared::new(frame_size);
        let clock = Arc::new(FrameClock::new(Instant::now(), 0.0));
        let asm = Assembler::new(TEST_FLAG_BASE, frame_size, exact, clock, Arc::clone(&shared));
        (asm, shared)
    }

    fn take_ready(shared: &StreamShared) -> Option<RawFrame> {
        shared.slot.lock().ready.take()
    }

    #[test]
    fn assembles_frame_across_packets() {
        let (mut asm, shared) = assembler(8, true);
        asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[1, 2, 3]));
        asm.handle_packet(&packet(0x2, &[4, 5, 6]));
        assert!(take_ready(&shared).is_none());
        asm.handle_packet(&packet(FLAG_END_OF_FRAME, &[7, 8]));

        let frame = take_ready(&shared).expect("frame published");
        assert!(frame.intact);
        assert_eq!(frame.len, 8);
        assert_eq!(&frame.data[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn truncated_frame_is_not_intact_and_next_resumes() {
        let (mut asm, shared) = assembler(4, true);

        // End-of-frame arrives with one byte missing.
        asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[1, 2]));
        asm.handle_packet(&packet(FLAG_END_OF_FRAME, &[3]));
        let bad = take_ready(&shared).expect("incomplete frame still published");
        assert!(!bad.intact);
        shared.recycle(bad.data);

        // The next frame assembles cleanly.
        asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[9, 9]));
        asm.handle_packet(&packet(FLAG_END_OF_FRAME, &[9, 9]));
        let good = take_ready(&shared).expect("clean frame published");
        assert!(good.intact);
        assert_eq!(&good.data[..4], &[9, 9, 9, 9]);
        assert_eq!(asm.dropped_frames(), 1);
    }

    #[test]
    fn missing_end_of_frame_is_dropped_at_next_start() {
        let (mut asm, shared) = assembler(4, true);
        asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[1, 2, 3, 4]));
        // No end packet; the next start finalizes it as incomplete.
        asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[5, 6]));
        let stale = take_ready(&shared).expect("unterminated frame published");
        assert!(!stale.intact);
        shared.recycle(stale.data);

        asm.handle_packet(&packet(FLAG_END_OF_FRAME, &[7, 8]));
        let frame = take_ready(&shared).expect("second frame published");
        assert!(frame.intact);
        assert_eq!(&frame.data[..4], &[5, 6, 7, 8]);
    }

    #[test]
    fn overflow_marks_frame_corrupt() {
        let (mut asm, shared) = assembler(3, true);
        asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[1, 2, 3]));
        asm.handle_packet(&packet(FLAG_END_OF_FRAME, &[4, 5]));
        let frame = take_ready(&shared).expect("published");
        assert!(!frame.intact);
    }

    #[test]
    fn foreign_stream_tag_is_ignored() {
        let (mut asm, shared) = assembler(4, true);
        asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[1, 2]));

        let mut foreign = packet(0x2, &[0xff, 0xff]);
        foreign[FLAG_OFFSET] = 0x80 | 0x2;
        asm.handle_packet(&foreign);

        asm.handle_packet(&packet(FLAG_END_OF_FRAME, &[3, 4]));
        let frame = take_ready(&shared).expect("published");
        assert!(frame.intact);
        assert_eq!(&frame.data[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn variable_length_stream_accepts_short_frames() {
        let (mut asm, shared) = assembler(16, false);
        asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[1, 2, 3]));
        asm.handle_packet(&packet(FLAG_END_OF_FRAME, &[4]));
        let frame = take_ready(&shared).expect("published");
        assert!(frame.intact);
        assert_eq!(frame.len, 4);
        assert_eq!(&frame.data[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn unread_frame_is_overwritten_by_fresher_one() {
        let (mut asm, shared) = assembler(2, true);
        for value in 0u8..4 {
            asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[value]));
            asm.handle_packet(&packet(FLAG_END_OF_FRAME, &[value]));
        }
        let frame = take_ready(&shared).expect("published");
        assert_eq!(&frame.data[..2], &[3, 3], "consumer sees the freshest frame");
    }

    #[test]
    fn timestamps_are_strictly_monotonic() {
        let (mut asm, shared) = assembler(1, true);
        let mut last = -1.0;
        for value in 0u8..5 {
            asm.handle_packet(&packet(FLAG_START_OF_FRAME, &[])); // stamp
            std::thread::sleep(std::time::Duration::from_millis(2));
            asm.handle_packet(&packet(FLAG_END_OF_FRAME, &[value]));
            let frame = take_ready(&shared).expect("published");
            assert!(frame.timestamp > last);
            last = frame.timestamp;
            shared.recycle(frame.data);
        }
    }
}
