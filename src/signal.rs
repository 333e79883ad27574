//! Single-slot "new frame" flag shared between the producer thread and the
//! render thread. Signals raised before the renderer drains coalesce into one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct FrameAvailabilitySignal {
    pending: AtomicBool,
    raised: AtomicU64,
    drained: AtomicU64,
}

impl FrameAvailabilitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the producer once a new image is ready. Never blocks.
    pub fn signal(&self) {
        self.raised.fetch_add(1, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Returns true at most once per burst of `signal()` calls.
    pub fn drain(&self) -> bool {
        let was_pending = self.pending.swap(false, Ordering::AcqRel);
        if was_pending {
            self.drained.fetch_add(1, Ordering::Relaxed);
        }
        was_pending
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Frames announced by the producer that were overwritten before the
    /// renderer got to them.
    pub fn coalesced(&self) -> u64 {
        let raised = self.raised.load(Ordering::Relaxed);
        let drained = self.drained.load(Ordering::Relaxed);
        let pending = u64::from(self.is_pending());
        raised.saturating_sub(drained + pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn repeated_signals_drain_once() {
        let signal = FrameAvailabilitySignal::new();
        for _ in 0..5 {
            signal.signal();
        }
        assert!(signal.drain());
        assert!(!signal.drain());
        assert!(!signal.drain());
        assert_eq!(signal.coalesced(), 4);

        signal.signal();
        assert!(signal.drain());
        assert!(!signal.drain());
    }

    #[test]
    fn drain_without_signal_is_false() {
        let signal = FrameAvailabilitySignal::new();
        assert!(!signal.drain());
        assert_eq!(signal.coalesced(), 0);
    }

    #[test]
    fn reset_discards_pending_frame() {
        let signal = FrameAvailabilitySignal::new();
        signal.signal();
        signal.reset();
        assert!(!signal.is_pending());
        assert!(!signal.drain());
    }

    #[test]
    fn producer_thread_never_blocks_on_consumer() {
        let signal = Arc::new(FrameAvailabilitySignal::new());
        let producer = {
            let signal = signal.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    signal.signal();
                }
            })
        };
        let mut drained = 0;
        while !producer.is_finished() {
            if signal.drain() {
                drained += 1;
            }
        }
        producer.join().expect("producer thread panicked");
        if signal.drain() {
            drained += 1;
        }
        assert!(drained >= 1);
        assert!(drained <= 10_000);
        assert!(!signal.drain());
    }
}
