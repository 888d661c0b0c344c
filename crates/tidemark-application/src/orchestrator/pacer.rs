use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-provider request pacer shared by every worker: each `wait()` reserves
/// the next slot separated by `interval`, so total throughput against one
/// provider never exceeds its documented limit no matter how many workers
/// are running.
pub struct ProviderPacer {
    interval: Duration,
    next_at: Mutex<Instant>,
}

impl ProviderPacer {
    pub fn new(interval: Duration) -> Self {
        // First call proceeds immediately.
        Self {
            interval,
            next_at: Mutex::new(Instant::now()),
        }
    }

    /// Blocks the calling worker until its reserved slot. Only the slot
    /// reservation holds the lock; the sleep itself never blocks peers.
    pub fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let deadline = {
            let mut next_at = self
                .next_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            let deadline = (*next_at).max(now);
            *next_at = deadline + self.interval;
            deadline
        };
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}
