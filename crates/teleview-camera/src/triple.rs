//! Wait-free single-producer / single-consumer triple buffer.
//!
//! Three slots and one atomic publication word give a handoff where the
//! producer can always write and the consumer always reads the freshest
//! fully-posted value. Posting over an unread slot simply replaces it; for
//! live video that drop-the-stale behavior is the point.
//!
//! The publication word packs the index of the most recently posted slot
//! together with a dirty bit. The three indices (producer's write slot, the
//! posted slot, the consumer's read slot) are a permutation of `{0, 1, 2}`
//! at all times: `publish` swaps the write slot with the posted slot,
//! `refresh` swaps the posted slot with the read slot, and neither side ever
//! touches the slot the word currently names. That exclusivity is what makes
//! the unsynchronized slot access below sound.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const DIRTY: u8 = 0b100;
const INDEX_MASK: u8 = 0b011;

struct Shared<T> {
    slots: [UnsafeCell<T>; 3],
    /// Index of the most recently posted slot, plus [`DIRTY`] while that
    /// post has not been picked up by the consumer.
    back: AtomicU8,
}

// SAFETY: a slot is only ever accessed by the side whose handle currently
// owns its index. Ownership moves between sides exclusively through the
// `back` swaps (AcqRel), which order the producer's writes before the
// consumer's reads of the same slot.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

/// Create a triple buffer with every slot initialized to `init`.
///
/// No further allocation happens after this call; both handles recycle the
/// three slots forever.
pub fn triple_buffer<T: Clone + Send>(init: T) -> (TripleProducer<T>, TripleConsumer<T>) {
    let shared = Arc::new(Shared {
        slots: [
            UnsafeCell::new(init.clone()),
            UnsafeCell::new(init.clone()),
            UnsafeCell::new(init),
        ],
        back: AtomicU8::new(1),
    });
    (
        TripleProducer {
            shared: Arc::clone(&shared),
            write: 0,
        },
        TripleConsumer { shared, read: 2 },
    )
}

/// Producer half. Obtain the write slot with [`input`](Self::input), fill
/// it, then [`publish`](Self::publish). Never blocks.
pub struct TripleProducer<T> {
    shared: Arc<Shared<T>>,
    write: u8,
}

impl<T: Send> TripleProducer<T> {
    /// Mutable access to the slot that is neither posted nor locked by the
    /// consumer.
    pub fn input(&mut self) -> &mut T {
        // SAFETY: `self.write` is owned by the producer until `publish`
        // swaps it away; the consumer can never name this index.
        unsafe { &mut *self.shared.slots[self.write as usize].get() }
    }

    /// Atomically post the write slot. A previously posted but unread slot
    /// is reclaimed as the next write slot.
    pub fn publish(&mut self) {
        let prev = self
            .shared
            .back
            .swap(self.write | DIRTY, Ordering::AcqRel);
        self.write = prev & INDEX_MASK;
    }
}

/// Consumer half. [`refresh`](Self::refresh) swaps in the newest posted
/// slot; [`read`](Self::read) borrows whatever is currently locked.
pub struct TripleConsumer<T> {
    shared: Arc<Shared<T>>,
    read: u8,
}

impl<T: Send> TripleConsumer<T> {
    /// Returns `true` iff a slot newer than the currently locked one has
    /// been posted, atomically taking ownership of it.
    pub fn refresh(&mut self) -> bool {
        if self.shared.back.load(Ordering::Relaxed) & DIRTY == 0 {
            return false;
        }
        // The dirty bit is only ever cleared here, so it is still set no
        // matter how many times the producer re-posted in between.
        let prev = self.shared.back.swap(self.read, Ordering::AcqRel);
        self.read = prev & INDEX_MASK;
        true
    }

    /// The most recent value obtained by [`refresh`](Self::refresh).
    pub fn read(&self) -> &T {
        // SAFETY: `self.read` is owned by the consumer until the next
        // `refresh`; the producer can never name this index.
        unsafe { &*self.shared.slots[self.read as usize].get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn consumer_sees_freshest_value() {
        let (mut tx, mut rx) = triple_buffer(0u64);
        assert!(!rx.refresh());

        *tx.input() = 1;
        tx.publish();
        *tx.input() = 2;
        tx.publish();

        assert!(rx.refresh());
        assert_eq!(*rx.read(), 2);
        assert!(!rx.refresh());
        assert_eq!(*rx.read(), 2);
    }

    #[test]
    fn locked_value_survives_later_posts() {
        let (mut tx, mut rx) = triple_buffer(0u64);
        *tx.input() = 1;
        tx.publish();
        assert!(rx.refresh());

        *tx.input() = 2;
        tx.publish();
        *tx.input() = 3;
        tx.publish();
        assert_eq!(*rx.read(), 1);

        assert!(rx.refresh());
        assert_eq!(*rx.read(), 3);
    }

    #[test]
    fn no_torn_reads_under_concurrency() {
        use std::sync::atomic::AtomicBool;

        // Each posted value is a pair (n, !n); a torn read would break the
        // relation.
        let (mut tx, mut rx) = triple_buffer([0u64, !0u64]);
        let done = Arc::new(AtomicBool::new(false));
        let done_tx = Arc::clone(&done);

        let producer = thread::spawn(move || {
            for n in 1..100_000u64 {
                let slot = tx.input();
                slot[0] = n;
                slot[1] = !n;
                tx.publish();
            }
            done_tx.store(true, Ordering::Release);
        });

        let consumer = thread::spawn(move || {
            let mut last = 0u64;
            loop {
                let finished = done.load(Ordering::Acquire);
                if rx.refresh() {
                    let value = rx.read();
                    assert_eq!(value[1], !value[0], "torn read");
                    assert!(value[0] >= last, "stale value after newer one");
                    last = value[0];
                } else if finished {
                    break;
                }
            }
            assert_eq!(last, 99_999);
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
