//! Download-direction state machine for one page.
//!
//! `start` pulls the backlog from the stored cursor and arms a cloud
//! watcher; `pump` drains watcher notifications and due retries. Batches
//! arriving while one is applied queue in the watcher channel and are
//! processed strictly in cloud order.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Receiver;

use crate::cloud::{PageCloud, PageCloudEvent};
use crate::core::PositionToken;
use crate::storage::{PageStorage, SYNC_CURSOR_KEY};

use super::SyncError;
use super::backoff::Backoff;
use super::batch_download::BatchDownload;
use super::state::{DownloadState, SyncStateTracker};

/// Which phase a scheduled retry resumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RetryPhase {
    Backlog,
    Watcher,
}

pub struct PageDownload {
    storage: Arc<dyn PageStorage>,
    page_cloud: Arc<dyn PageCloud>,
    tracker: Arc<SyncStateTracker>,
    backoff: Box<dyn Backoff>,
    events: Option<Receiver<PageCloudEvent>>,
    retry: Option<(Instant, RetryPhase)>,
}

impl PageDownload {
    pub fn new(
        storage: Arc<dyn PageStorage>,
        page_cloud: Arc<dyn PageCloud>,
        tracker: Arc<SyncStateTracker>,
        backoff: Box<dyn Backoff>,
    ) -> Self {
        Self {
            storage,
            page_cloud,
            tracker,
            backoff,
            events: None,
            retry: None,
        }
    }

    /// Begin continuous download: backlog first, then push notifications.
    pub fn start(&mut self) {
        self.run_backlog();
    }

    /// Process due retries and queued watcher notifications. Returns true
    /// if any work was done.
    pub fn pump(&mut self) -> bool {
        let mut worked = false;

        if let Some((at, phase)) = self.retry
            && Instant::now() >= at
        {
            self.retry = None;
            worked = true;
            match phase {
                RetryPhase::Backlog => self.run_backlog(),
                RetryPhase::Watcher => self.set_watcher(),
            }
        }

        loop {
            let Some(events) = &self.events else { break };
            let Ok(event) = events.try_recv() else { break };
            worked = true;
            let PageCloudEvent::NewCommits { commits, position } = event;
            self.apply_batch_from_watcher(commits, position);
        }

        worked
    }

    /// True when there is nothing to do and nothing scheduled.
    pub fn is_idle(&self) -> bool {
        self.retry.is_none()
            && self
                .events
                .as_ref()
                .map(|events| events.is_empty())
                .unwrap_or(true)
    }

    fn run_backlog(&mut self) {
        self.tracker.set_download(DownloadState::Backlog);

        let cursor = match self.cursor() {
            Ok(cursor) => cursor,
            Err(err) => {
                self.permanent_error("failed to read the sync cursor", &err);
                return;
            }
        };

        match self.page_cloud.get_commits(cursor.as_ref()) {
            Ok((commits, position)) => {
                self.backoff.reset();
                if commits.is_empty() && position.is_none() {
                    tracing::debug!(page = %self.storage.page_id(), "no remote commits to download");
                } else {
                    let count = commits.len();
                    let batch = BatchDownload::new(
                        Arc::clone(&self.storage),
                        Arc::clone(&self.page_cloud),
                        commits,
                        position,
                    );
                    if let Err(err) = batch.run(self.backoff.as_mut()) {
                        self.handle_batch_error(err);
                        return;
                    }
                    tracing::debug!(
                        page = %self.storage.page_id(),
                        commits = count,
                        "backlog download finished"
                    );
                }
                self.set_watcher();
            }
            Err(err) if err.transience().is_retryable() => {
                tracing::warn!(
                    page = %self.storage.page_id(),
                    error = %err,
                    "fetching remote commits failed, retrying"
                );
                self.schedule_retry(RetryPhase::Backlog);
            }
            Err(err) => {
                self.permanent_error("fetching remote commits failed", &err.into());
            }
        }
    }

    fn set_watcher(&mut self) {
        self.tracker.set_download(DownloadState::SettingWatcher);

        let cursor = match self.cursor() {
            Ok(cursor) => cursor,
            Err(err) => {
                self.permanent_error("failed to read the sync cursor", &err);
                return;
            }
        };

        let (tx, rx) = crossbeam::channel::unbounded();
        match self.page_cloud.set_watcher(cursor.as_ref(), tx) {
            Ok(()) => {
                self.events = Some(rx);
                self.tracker.set_download(DownloadState::Idle);
            }
            Err(err) if err.transience().is_retryable() => {
                tracing::warn!(
                    page = %self.storage.page_id(),
                    error = %err,
                    "setting the cloud watcher failed, retrying"
                );
                self.schedule_retry(RetryPhase::Watcher);
            }
            Err(err) => {
                self.permanent_error("setting the cloud watcher failed", &err.into());
            }
        }
    }

    fn apply_batch_from_watcher(
        &mut self,
        commits: Vec<crate::cloud::RemoteCommit>,
        position: PositionToken,
    ) {
        self.tracker.set_download(DownloadState::InProgress);
        let batch = BatchDownload::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.page_cloud),
            commits,
            Some(position),
        );
        match batch.run(self.backoff.as_mut()) {
            Ok(()) => self.tracker.set_download(DownloadState::Idle),
            Err(err) => self.handle_batch_error(err),
        }
    }

    fn handle_batch_error(&mut self, err: SyncError) {
        if err.transience().is_retryable() {
            // Nothing was applied and the cursor did not move, so rewinding
            // to a fresh backlog pass redelivers the same batch.
            tracing::warn!(
                page = %self.storage.page_id(),
                error = %err,
                "applying a remote batch failed, rewinding to backlog"
            );
            self.events = None;
            self.schedule_retry(RetryPhase::Backlog);
        } else {
            self.permanent_error("failed to persist a remote commit in storage", &err);
        }
    }

    fn schedule_retry(&mut self, phase: RetryPhase) {
        self.tracker.set_download(DownloadState::TemporaryError);
        let delay = self.backoff.next_delay();
        self.retry = Some((Instant::now() + delay, phase));
    }

    fn permanent_error(&mut self, context: &str, err: &SyncError) {
        tracing::error!(
            page = %self.storage.page_id(),
            error = %err,
            "{context}; stopping download sync"
        );
        self.events = None;
        self.retry = None;
        self.tracker.set_download(DownloadState::PermanentError);
    }

    fn cursor(&self) -> Result<Option<PositionToken>, SyncError> {
        let stored = self.storage.sync_metadata(SYNC_CURSOR_KEY)?;
        Ok(stored.map(|bytes| PositionToken::new(bytes.to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{FailOp, FakeCloud};
    use crate::cloud::{CloudProvider, RemoteCommit};
    use crate::core::{CommitId, PageId, encode_commit};
    use crate::storage::{JournalType, MemoryPageStorage};
    use crate::sync::backoff::TestBackoff;
    use bytes::Bytes;
    use std::time::Duration;

    fn page() -> PageId {
        PageId::from_bytes([9u8; 16])
    }

    fn remote_commit(source: &MemoryPageStorage, key: &str, value: &[u8]) -> RemoteCommit {
        let mut journal = source
            .start_commit(&CommitId::root(), JournalType::Implicit)
            .unwrap();
        journal.put(key, Bytes::copy_from_slice(value));
        let commit = source.commit_journal(journal).unwrap();
        let snapshot = source.snapshot(&commit.id()).unwrap();
        let encoded = encode_commit(
            commit.parents(),
            commit.generation(),
            commit.timestamp_ms(),
            snapshot.tree(),
            source.inline_limit(),
        )
        .unwrap();
        RemoteCommit {
            id: commit.id(),
            data: encoded.bytes,
        }
    }

    fn download_for(
        cloud: &FakeCloud,
        storage: &Arc<MemoryPageStorage>,
    ) -> (PageDownload, Arc<SyncStateTracker>) {
        let tracker = Arc::new(SyncStateTracker::new());
        let download = PageDownload::new(
            Arc::clone(storage) as Arc<dyn PageStorage>,
            cloud.page_cloud(&page()),
            Arc::clone(&tracker),
            Box::new(TestBackoff::new(Duration::ZERO)),
        );
        (download, tracker)
    }

    #[test]
    fn backlog_then_watcher_push() {
        let source = MemoryPageStorage::new(page());
        let first = remote_commit(&source, "a", b"1");

        let cloud = FakeCloud::new();
        cloud
            .page_cloud(&page())
            .add_commits(vec![first.clone()])
            .unwrap();

        let storage = Arc::new(MemoryPageStorage::new(page()));
        let (mut download, tracker) = download_for(&cloud, &storage);
        download.start();

        assert_eq!(tracker.download(), DownloadState::Idle);
        assert!(storage.head_commit_ids().contains(&first.id));

        // A commit pushed after start arrives through the watcher.
        let second = remote_commit(&source, "b", b"2");
        cloud
            .page_cloud(&page())
            .add_commits(vec![second.clone()])
            .unwrap();
        assert!(download.pump());
        assert!(storage.head_commit_ids().contains(&second.id));
        assert_eq!(tracker.download(), DownloadState::Idle);
    }

    #[test]
    fn transient_cloud_failure_retries() {
        let cloud = FakeCloud::new();
        cloud.fail_next(FailOp::GetCommits, 1);

        let storage = Arc::new(MemoryPageStorage::new(page()));
        let (mut download, tracker) = download_for(&cloud, &storage);
        download.start();
        assert_eq!(tracker.download(), DownloadState::TemporaryError);

        // Zero-delay backoff: the retry is due immediately.
        assert!(download.pump());
        assert_eq!(tracker.download(), DownloadState::Idle);
    }

    #[test]
    fn storage_failure_rewinds_and_redelivers() {
        let source = MemoryPageStorage::new(page());
        let commit = remote_commit(&source, "a", b"1");

        let cloud = FakeCloud::new();
        let storage = Arc::new(MemoryPageStorage::new(page()));
        let (mut download, tracker) = download_for(&cloud, &storage);
        download.start();
        assert_eq!(tracker.download(), DownloadState::Idle);

        storage.fail_next_add_commits_from_sync(1);
        cloud
            .page_cloud(&page())
            .add_commits(vec![commit.clone()])
            .unwrap();

        assert!(download.pump());
        assert_eq!(tracker.download(), DownloadState::TemporaryError);
        assert_eq!(storage.head_commit_ids(), vec![CommitId::root()]);

        assert!(download.pump());
        assert_eq!(tracker.download(), DownloadState::Idle);
        assert_eq!(storage.head_commit_ids(), vec![commit.id]);
    }

    #[test]
    fn malformed_remote_commit_is_permanent() {
        let cloud = FakeCloud::new();
        cloud
            .page_cloud(&page())
            .add_commits(vec![RemoteCommit {
                id: CommitId::from_bytes([1u8; 32]),
                data: Bytes::from_static(b"garbage"),
            }])
            .unwrap();

        let storage = Arc::new(MemoryPageStorage::new(page()));
        let (mut download, tracker) = download_for(&cloud, &storage);
        download.start();
        assert_eq!(tracker.download(), DownloadState::PermanentError);
        assert!(!download.pump());
    }
}
