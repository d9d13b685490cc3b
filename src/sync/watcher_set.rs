//! Fan-out of sync state to an open-ended set of watchers.
//!
//! Each watcher owns a coalescing slot: the set writes the latest pair into
//! every slot, a watcher pulls it out with [`SyncWatcherHandle::next`]. The
//! pull is the acknowledgement, so one watcher can never observe overlapping
//! or out-of-order deliveries, and a slow watcher only coalesces its own
//! backlog; it never blocks the set or other watchers.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use super::state::SyncStatePair;

struct Slot {
    pending: Mutex<Option<SyncStatePair>>,
    available: Condvar,
}

/// A registered watcher's receiving end.
pub struct SyncWatcherHandle {
    slot: Arc<Slot>,
}

impl SyncWatcherHandle {
    /// Take the next state pair without blocking.
    pub fn try_next(&self) -> Option<SyncStatePair> {
        self.slot
            .pending
            .lock()
            .expect("watcher slot lock poisoned")
            .take()
    }

    /// Wait up to `timeout` for the next state pair.
    pub fn next_timeout(&self, timeout: Duration) -> Option<SyncStatePair> {
        let guard = self
            .slot
            .pending
            .lock()
            .expect("watcher slot lock poisoned");
        let (mut guard, _) = self
            .slot
            .available
            .wait_timeout_while(guard, timeout, |pending| pending.is_none())
            .expect("watcher slot lock poisoned");
        guard.take()
    }
}

/// Broadcasts the current (download, upload) pair to subscribers.
pub struct SyncWatcherSet {
    inner: Mutex<SetState>,
}

struct SetState {
    current: SyncStatePair,
    slots: Vec<Weak<Slot>>,
}

impl SyncWatcherSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SetState {
                current: SyncStatePair::idle(),
                slots: Vec::new(),
            }),
        }
    }

    /// Register a watcher. It immediately receives the latest known state,
    /// even if nothing changed since the last broadcast, so it never has to
    /// race registration against the first transition.
    pub fn add_watcher(&self) -> SyncWatcherHandle {
        let mut inner = self.lock();
        let slot = Arc::new(Slot {
            pending: Mutex::new(Some(inner.current)),
            available: Condvar::new(),
        });
        inner.slots.push(Arc::downgrade(&slot));
        SyncWatcherHandle { slot }
    }

    /// Deliver a new pair to every live watcher. Dropped watchers are pruned
    /// here, lazily.
    pub fn notify(&self, pair: SyncStatePair) {
        let mut inner = self.lock();
        inner.current = pair;
        inner.slots.retain(|weak| {
            let Some(slot) = weak.upgrade() else {
                return false;
            };
            *slot.pending.lock().expect("watcher slot lock poisoned") = Some(pair);
            slot.available.notify_all();
            true
        });
    }

    pub fn watcher_count(&self) -> usize {
        self.lock().slots.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SetState> {
        self.inner.lock().expect("watcher set lock poisoned")
    }
}

impl Default for SyncWatcherSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::state::SyncState;

    fn pair(download: SyncState, upload: SyncState) -> SyncStatePair {
        SyncStatePair { download, upload }
    }

    #[test]
    fn new_watcher_gets_latest_state_immediately() {
        let set = SyncWatcherSet::new();
        set.notify(pair(SyncState::InProgress, SyncState::Idle));

        let watcher = set.add_watcher();
        assert_eq!(
            watcher.try_next(),
            Some(pair(SyncState::InProgress, SyncState::Idle))
        );
        // Exactly one delivery until the next notify.
        assert_eq!(watcher.try_next(), None);
    }

    #[test]
    fn slow_watcher_coalesces_to_latest() {
        let set = SyncWatcherSet::new();
        let watcher = set.add_watcher();
        let _ = watcher.try_next();

        set.notify(pair(SyncState::Pending, SyncState::Idle));
        set.notify(pair(SyncState::InProgress, SyncState::Idle));
        set.notify(pair(SyncState::Idle, SyncState::Idle));

        assert_eq!(
            watcher.try_next(),
            Some(pair(SyncState::Idle, SyncState::Idle))
        );
        assert_eq!(watcher.try_next(), None);
    }

    #[test]
    fn dropped_watchers_are_pruned_on_notify() {
        let set = SyncWatcherSet::new();
        let kept = set.add_watcher();
        let dropped = set.add_watcher();
        assert_eq!(set.watcher_count(), 2);

        drop(dropped);
        set.notify(pair(SyncState::Pending, SyncState::Pending));
        assert_eq!(set.watcher_count(), 1);
        assert_eq!(
            kept.try_next(),
            Some(pair(SyncState::Pending, SyncState::Pending))
        );
    }

    #[test]
    fn watchers_do_not_block_each_other() {
        let set = SyncWatcherSet::new();
        let fast = set.add_watcher();
        let slow = set.add_watcher();

        set.notify(pair(SyncState::InProgress, SyncState::Idle));
        // Fast consumes; slow does not. Next notify still reaches both.
        assert!(fast.try_next().is_some());
        set.notify(pair(SyncState::Idle, SyncState::Idle));
        assert_eq!(
            fast.try_next(),
            Some(pair(SyncState::Idle, SyncState::Idle))
        );
        assert_eq!(
            slow.try_next(),
            Some(pair(SyncState::Idle, SyncState::Idle))
        );
    }
}
