//! New-frame notification shared by the camera callbacks and the fan-out.
//!
//! A bare condition variable can miss a signal sent between a check and
//! the wait; pairing the condvar with a generation counter under its mutex
//! makes every notification observable.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Cloneable handle to a shared frame-arrival condition.
#[derive(Clone)]
pub struct FrameNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl FrameNotifier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                generation: Mutex::new(0),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Record an event and wake all waiters.
    pub fn notify(&self) {
        let mut generation = self.inner.generation.lock();
        *generation += 1;
        self.inner.condvar.notify_all();
    }

    /// Current generation; pass it to [`wait_beyond`](Self::wait_beyond).
    pub fn generation(&self) -> u64 {
        *self.inner.generation.lock()
    }

    /// Wait until the generation advances past `seen` or the timeout
    /// elapses; returns the generation observed on wake-up.
    pub fn wait_beyond(&self, seen: u64, timeout: Duration) -> u64 {
        let mut generation = self.inner.generation.lock();
        if *generation == seen {
            let _ = self.inner.condvar.wait_for(&mut generation, timeout);
        }
        *generation
    }
}

impl Default for FrameNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn notification_between_check_and_wait_is_not_lost() {
        let notifier = FrameNotifier::new();
        let seen = notifier.generation();

        // Notify before the wait even starts; the wait must return
        // immediately because the generation moved past `seen`.
        notifier.notify();
        let now = notifier.wait_beyond(seen, Duration::from_secs(5));
        assert!(now > seen);
    }

    #[test]
    fn wait_wakes_on_notify() {
        let notifier = FrameNotifier::new();
        let seen = notifier.generation();

        let waker = {
            let notifier = notifier.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                notifier.notify();
            })
        };
        let now = notifier.wait_beyond(seen, Duration::from_secs(5));
        assert_eq!(now, seen + 1);
        waker.join().unwrap();
    }

    #[test]
    fn wait_times_out_without_events() {
        let notifier = FrameNotifier::new();
        let seen = notifier.generation();
        let now = notifier.wait_beyond(seen, Duration::from_millis(10));
        assert_eq!(now, seen);
    }
}
