//! Monotonic wall clock for commit timestamps.
//!
//! Commit timestamps participate in head ordering and in the deterministic
//! construction of merge commits, so they must never move backward within
//! one storage instance, even when the OS clock does.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds with a monotonicity guarantee.
pub struct Clock {
    last_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            last_ms: Self::now_ms(),
        }
    }

    /// Produce a timestamp strictly greater than any previously returned.
    pub fn tick(&mut self) -> u64 {
        let now = Self::now_ms();
        self.last_ms = if now > self.last_ms {
            now
        } else {
            // Same millisecond or clock went backward.
            self.last_ms + 1
        };
        self.last_ms
    }

    /// Observe a remote timestamp so subsequent ticks stay ahead of it.
    ///
    /// Call this when applying commits received from sync.
    pub fn observe(&mut self, remote_ms: u64) {
        if remote_ms > self.last_ms {
            self.last_ms = remote_ms;
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_strictly_increasing() {
        let mut clock = Clock::new();
        let a = clock.tick();
        let b = clock.tick();
        let c = clock.tick();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn observe_advances_past_remote() {
        let mut clock = Clock::new();
        let far_future = Clock::now_ms() + 1_000_000;
        clock.observe(far_future);
        assert!(clock.tick() > far_future);
    }

    #[test]
    fn observe_ignores_stale_remote() {
        let mut clock = Clock::new();
        let before = clock.tick();
        clock.observe(1);
        assert!(clock.tick() > before);
    }
}
