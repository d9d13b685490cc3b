//! Upload-direction state machine for one page.
//!
//! Local commits mark the upload pending; the actual push happens on `pump`,
//! and only while the download direction is quiet, so a batch arriving from
//! the cloud (and any merge it triggers) is folded in before we publish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::cloud::{PageCloud, RemoteCommit};
use crate::core::encode_commit;
use crate::storage::{CommitSource, CommitWatcher, PageStorage};

use super::SyncError;
use super::backoff::Backoff;
use super::state::{DownloadState, SyncStateTracker, UploadState};

/// Commit watcher flipping the upload's pending flag on local commits.
pub struct UploadTrigger {
    pending: Arc<AtomicBool>,
}

impl CommitWatcher for UploadTrigger {
    fn on_new_commits(&self, _commits: &[crate::core::Commit], source: CommitSource) {
        if source == CommitSource::Local {
            self.pending.store(true, Ordering::Release);
        }
    }
}

pub struct PageUpload {
    storage: Arc<dyn PageStorage>,
    page_cloud: Arc<dyn PageCloud>,
    tracker: Arc<SyncStateTracker>,
    backoff: Box<dyn Backoff>,
    inline_limit: usize,
    pending: Arc<AtomicBool>,
    retry_at: Option<Instant>,
}

impl PageUpload {
    /// Returns the upload plus the trigger the caller must register as a
    /// commit watcher (and keep alive).
    pub fn new(
        storage: Arc<dyn PageStorage>,
        page_cloud: Arc<dyn PageCloud>,
        tracker: Arc<SyncStateTracker>,
        backoff: Box<dyn Backoff>,
        inline_limit: usize,
    ) -> (Self, Arc<UploadTrigger>) {
        let pending = Arc::new(AtomicBool::new(false));
        let trigger = Arc::new(UploadTrigger {
            pending: Arc::clone(&pending),
        });
        (
            Self {
                storage,
                page_cloud,
                tracker,
                backoff,
                inline_limit,
                pending,
                retry_at: None,
            },
            trigger,
        )
    }

    pub fn start(&mut self) {
        if self.storage.unsynced_commits().is_empty() {
            self.tracker.set_upload(UploadState::Idle);
        } else {
            self.pending.store(true, Ordering::Release);
            self.tracker.set_upload(UploadState::Pending);
        }
    }

    /// Attempt pending work. Returns true if any work was done.
    pub fn pump(&mut self) -> bool {
        if self.tracker.upload() == UploadState::PermanentError {
            return false;
        }

        if let Some(at) = self.retry_at {
            if Instant::now() < at {
                return false;
            }
            self.retry_at = None;
            self.attempt();
            return true;
        }

        if !self.pending.load(Ordering::Acquire) {
            return false;
        }

        if !self.download_quiet() {
            self.tracker.set_upload(UploadState::WaitRemoteDownload);
            return false;
        }

        self.attempt();
        true
    }

    pub fn is_idle(&self) -> bool {
        !self.pending.load(Ordering::Acquire) && self.retry_at.is_none()
    }

    fn download_quiet(&self) -> bool {
        matches!(
            self.tracker.download(),
            DownloadState::NotStarted | DownloadState::Idle | DownloadState::PermanentError
        )
    }

    fn attempt(&mut self) {
        let commits = self.storage.unsynced_commits();
        if commits.is_empty() {
            self.pending.store(false, Ordering::Release);
            self.tracker.set_upload(UploadState::Idle);
            return;
        }

        self.tracker.set_upload(UploadState::InProgress);
        match self.push(&commits) {
            Ok(()) => {
                self.backoff.reset();
                for commit in &commits {
                    if let Err(err) = self.storage.mark_commit_synced(&commit.id()) {
                        tracing::warn!(
                            page = %self.storage.page_id(),
                            commit = %commit.id(),
                            error = %err,
                            "failed to mark an uploaded commit synced"
                        );
                    }
                }
                // Commits created while we were pushing stay pending.
                if self.storage.unsynced_commits().is_empty() {
                    self.pending.store(false, Ordering::Release);
                    self.tracker.set_upload(UploadState::Idle);
                } else {
                    self.tracker.set_upload(UploadState::Pending);
                }
            }
            Err(err) if err.transience().is_retryable() => {
                tracing::warn!(
                    page = %self.storage.page_id(),
                    error = %err,
                    "commit upload failed, retrying"
                );
                self.tracker.set_upload(UploadState::TemporaryError);
                self.retry_at = Some(Instant::now() + self.backoff.next_delay());
            }
            Err(err) => {
                tracing::error!(
                    page = %self.storage.page_id(),
                    error = %err,
                    "commit upload failed permanently; stopping upload sync"
                );
                self.tracker.set_upload(UploadState::PermanentError);
            }
        }
    }

    /// Encode and push one batch: value objects first, then the commits, so
    /// the cloud log never references objects it does not hold.
    fn push(&self, commits: &[crate::core::Commit]) -> Result<(), SyncError> {
        let mut remotes = Vec::with_capacity(commits.len());
        for commit in commits {
            let snapshot = self.storage.snapshot(&commit.id())?;
            let encoded = encode_commit(
                commit.parents(),
                commit.generation(),
                commit.timestamp_ms(),
                snapshot.tree(),
                self.inline_limit,
            )?;
            for (hash, bytes) in encoded.objects {
                self.page_cloud.add_object(hash, bytes)?;
            }
            remotes.push(RemoteCommit {
                id: commit.id(),
                data: encoded.bytes,
            });
        }
        self.page_cloud.add_commits(remotes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{FailOp, FakeCloud};
    use crate::cloud::CloudProvider;
    use crate::core::{CommitId, PageId};
    use crate::storage::{JournalType, MemoryPageStorage};
    use crate::sync::backoff::TestBackoff;
    use bytes::Bytes;
    use std::sync::Weak;
    use std::time::Duration;

    fn page() -> PageId {
        PageId::from_bytes([11u8; 16])
    }

    fn upload_for(
        cloud: &FakeCloud,
        storage: &Arc<MemoryPageStorage>,
    ) -> (PageUpload, Arc<UploadTrigger>, Arc<SyncStateTracker>) {
        let tracker = Arc::new(SyncStateTracker::new());
        let (upload, trigger) = PageUpload::new(
            Arc::clone(storage) as Arc<dyn PageStorage>,
            cloud.page_cloud(&page()),
            Arc::clone(&tracker),
            Box::new(TestBackoff::new(Duration::ZERO)),
            storage.inline_limit(),
        );
        let trigger_dyn: Arc<dyn CommitWatcher> = trigger.clone();
        let weak: Weak<dyn CommitWatcher> = Arc::downgrade(&trigger_dyn);
        storage.register_commit_watcher(weak);
        (upload, trigger, tracker)
    }

    fn put(storage: &MemoryPageStorage, parent: &CommitId, key: &str, value: &str) -> CommitId {
        let mut journal = storage.start_commit(parent, JournalType::Implicit).unwrap();
        journal.put(key, Bytes::copy_from_slice(value.as_bytes()));
        storage.commit_journal(journal).unwrap().id()
    }

    #[test]
    fn local_commit_triggers_upload() {
        let cloud = FakeCloud::new();
        let storage = Arc::new(MemoryPageStorage::new(page()));
        let (mut upload, _trigger, tracker) = upload_for(&cloud, &storage);
        upload.start();
        assert_eq!(tracker.upload(), UploadState::Idle);

        put(&storage, &CommitId::root(), "k", "v");
        assert!(upload.pump());
        assert_eq!(tracker.upload(), UploadState::Idle);
        assert_eq!(cloud.commit_count(&page()), 1);
        assert!(storage.unsynced_commits().is_empty());
    }

    #[test]
    fn waits_for_download_to_go_quiet() {
        let cloud = FakeCloud::new();
        let storage = Arc::new(MemoryPageStorage::new(page()));
        let (mut upload, _trigger, tracker) = upload_for(&cloud, &storage);
        upload.start();

        put(&storage, &CommitId::root(), "k", "v");
        tracker.set_download(DownloadState::InProgress);
        assert!(!upload.pump());
        assert_eq!(tracker.upload(), UploadState::WaitRemoteDownload);
        assert_eq!(cloud.commit_count(&page()), 0);

        tracker.set_download(DownloadState::Idle);
        assert!(upload.pump());
        assert_eq!(cloud.commit_count(&page()), 1);
    }

    #[test]
    fn transient_failure_retries_with_backoff() {
        let cloud = FakeCloud::new();
        let storage = Arc::new(MemoryPageStorage::new(page()));
        let (mut upload, _trigger, tracker) = upload_for(&cloud, &storage);
        upload.start();

        put(&storage, &CommitId::root(), "k", "v");
        cloud.fail_next(FailOp::AddCommits, 1);
        assert!(upload.pump());
        assert_eq!(tracker.upload(), UploadState::TemporaryError);

        assert!(upload.pump());
        assert_eq!(tracker.upload(), UploadState::Idle);
        assert_eq!(cloud.commit_count(&page()), 1);
    }

    #[test]
    fn pushes_value_objects_before_commits() {
        let cloud = FakeCloud::new();
        let storage = Arc::new(MemoryPageStorage::new(page()));
        let (mut upload, _trigger, _tracker) = upload_for(&cloud, &storage);
        upload.start();

        let big = "x".repeat(storage.inline_limit() + 1);
        put(&storage, &CommitId::root(), "big", &big);
        assert!(upload.pump());

        // A second device can download the commit plus its object.
        let other = Arc::new(MemoryPageStorage::new(page()));
        let (commits, _) = cloud.page_cloud(&page()).get_commits(None).unwrap();
        let mut backoff = TestBackoff::new(Duration::ZERO);
        crate::sync::BatchDownload::new(
            Arc::clone(&other) as Arc<dyn PageStorage>,
            cloud.page_cloud(&page()),
            commits,
            None,
        )
        .run(&mut backoff)
        .unwrap();
        let head = other.head_commit_ids()[0];
        assert_eq!(
            other.snapshot(&head).unwrap().get("big"),
            Some(Bytes::from(big.into_bytes()))
        );
    }
}
