//! Sync state tracking and the internal-to-public state mapping.

use std::sync::Mutex;

use super::watcher_set::{SyncWatcherHandle, SyncWatcherSet};

/// Publicly visible state of one sync direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Pending,
    InProgress,
    Error,
}

/// The (download, upload) pair delivered to sync watchers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncStatePair {
    pub download: SyncState,
    pub upload: SyncState,
}

impl SyncStatePair {
    pub fn idle() -> Self {
        Self {
            download: SyncState::Idle,
            upload: SyncState::Idle,
        }
    }
}

/// Internal download-direction states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadState {
    NotStarted,
    Backlog,
    SettingWatcher,
    Idle,
    InProgress,
    TemporaryError,
    PermanentError,
}

/// Internal upload-direction states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    NotStarted,
    Idle,
    Pending,
    WaitRemoteDownload,
    InProgress,
    TemporaryError,
    PermanentError,
}

impl From<DownloadState> for SyncState {
    fn from(state: DownloadState) -> Self {
        match state {
            DownloadState::NotStarted | DownloadState::Idle => SyncState::Idle,
            // Temporary errors are retried; externally that is still pending work.
            DownloadState::Backlog
            | DownloadState::SettingWatcher
            | DownloadState::TemporaryError => SyncState::Pending,
            DownloadState::InProgress => SyncState::InProgress,
            DownloadState::PermanentError => SyncState::Error,
        }
    }
}

impl From<UploadState> for SyncState {
    fn from(state: UploadState) -> Self {
        match state {
            UploadState::NotStarted | UploadState::Idle => SyncState::Idle,
            UploadState::Pending
            | UploadState::WaitRemoteDownload
            | UploadState::TemporaryError => SyncState::Pending,
            UploadState::InProgress => SyncState::InProgress,
            UploadState::PermanentError => SyncState::Error,
        }
    }
}

/// Shared per-page tracker both directions report into.
///
/// Watchers are notified only when the externally visible pair changes;
/// internal transitions that map to the same public pair are silent.
pub struct SyncStateTracker {
    inner: Mutex<TrackerState>,
    watchers: SyncWatcherSet,
}

struct TrackerState {
    download: DownloadState,
    upload: UploadState,
    last_public: SyncStatePair,
}

impl SyncStateTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                download: DownloadState::NotStarted,
                upload: UploadState::NotStarted,
                last_public: SyncStatePair::idle(),
            }),
            watchers: SyncWatcherSet::new(),
        }
    }

    pub fn set_download(&self, state: DownloadState) {
        let changed = {
            let mut inner = self.lock();
            inner.download = state;
            inner.public_if_changed()
        };
        if let Some(pair) = changed {
            self.watchers.notify(pair);
        }
    }

    pub fn set_upload(&self, state: UploadState) {
        let changed = {
            let mut inner = self.lock();
            inner.upload = state;
            inner.public_if_changed()
        };
        if let Some(pair) = changed {
            self.watchers.notify(pair);
        }
    }

    pub fn download(&self) -> DownloadState {
        self.lock().download
    }

    pub fn upload(&self) -> UploadState {
        self.lock().upload
    }

    pub fn public_pair(&self) -> SyncStatePair {
        self.lock().last_public
    }

    /// Register a watcher; it immediately receives the latest pair.
    pub fn add_sync_watcher(&self) -> SyncWatcherHandle {
        self.watchers.add_watcher()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.inner.lock().expect("sync state lock poisoned")
    }
}

impl Default for SyncStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerState {
    fn public_if_changed(&mut self) -> Option<SyncStatePair> {
        let pair = SyncStatePair {
            download: self.download.into(),
            upload: self.upload.into(),
        };
        if pair == self.last_public {
            None
        } else {
            self.last_public = pair;
            Some(pair)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_when_public_pair_unchanged() {
        let tracker = SyncStateTracker::new();
        let watcher = tracker.add_sync_watcher();
        assert_eq!(watcher.try_next(), Some(SyncStatePair::idle()));

        // NotStarted -> Idle is not externally visible.
        tracker.set_download(DownloadState::Idle);
        assert_eq!(watcher.try_next(), None);

        tracker.set_download(DownloadState::InProgress);
        let pair = watcher.try_next().unwrap();
        assert_eq!(pair.download, SyncState::InProgress);
        assert_eq!(pair.upload, SyncState::Idle);
    }

    #[test]
    fn temporary_error_maps_to_pending() {
        assert_eq!(
            SyncState::from(DownloadState::TemporaryError),
            SyncState::Pending
        );
        assert_eq!(
            SyncState::from(UploadState::TemporaryError),
            SyncState::Pending
        );
        assert_eq!(
            SyncState::from(DownloadState::PermanentError),
            SyncState::Error
        );
    }
}
