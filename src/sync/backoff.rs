//! Retry delay policies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A strategy object producing successive retry delays.
pub trait Backoff: Send {
    /// Delay to wait before the next retry.
    fn next_delay(&mut self) -> Duration;

    /// Forget accumulated failures; the next delay starts from the base.
    fn reset(&mut self);
}

/// Doubling delays from `base` up to `max`.
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            next: base,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.base;
    }
}

/// Fixed-delay backoff with an observable call counter, for tests.
pub struct TestBackoff {
    delay: Duration,
    calls: Arc<AtomicU32>,
}

impl TestBackoff {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Handle counting how many delays were requested.
    pub fn call_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

impl Backoff for TestBackoff {
    fn next_delay(&mut self) -> Duration {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.delay
    }

    fn reset(&mut self) {}
}
