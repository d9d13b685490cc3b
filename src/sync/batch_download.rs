//! Atomic application of a batch of remote commits.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::cloud::{PageCloud, RemoteCommit};
use crate::core::{CommitId, ObjectHash, PositionToken, decode_commit};
use crate::storage::{PageStorage, SYNC_CURSOR_KEY};

use super::SyncError;
use super::backoff::Backoff;

/// Transient object fetches are retried this many times before the batch
/// gives up.
const OBJECT_FETCH_ATTEMPTS: u32 = 5;

/// Applies one batch of remote commits to local storage, then persists the
/// sync cursor.
///
/// Commits are durably applied *before* the cursor advances, so a crash
/// between the two steps costs at worst a redundant redownload, never a
/// silent loss. Any storage failure aborts the whole batch: nothing is
/// applied, the cursor stays put, and the caller's next sync pass redelivers.
///
/// `run` consumes the instance; a batch cannot be started twice.
pub struct BatchDownload {
    storage: Arc<dyn PageStorage>,
    page_cloud: Arc<dyn PageCloud>,
    commits: Vec<RemoteCommit>,
    position: Option<PositionToken>,
}

impl BatchDownload {
    pub fn new(
        storage: Arc<dyn PageStorage>,
        page_cloud: Arc<dyn PageCloud>,
        commits: Vec<RemoteCommit>,
        position: Option<PositionToken>,
    ) -> Self {
        Self {
            storage,
            page_cloud,
            commits,
            position,
        }
    }

    pub fn run(self, backoff: &mut dyn Backoff) -> Result<(), SyncError> {
        // Fetch referenced value objects first; the commit batch can only
        // apply once every object it needs is present locally.
        for remote in &self.commits {
            let wire = decode_commit(&remote.data)?;
            for hash in wire.referenced_objects() {
                if self.storage.has_object(&hash) {
                    continue;
                }
                let bytes = self.fetch_object(&hash, backoff)?;
                self.storage.add_object_from_sync(hash, bytes)?;
            }
        }

        if !self.commits.is_empty() {
            let batch: Vec<(CommitId, Bytes)> = self
                .commits
                .iter()
                .map(|remote| (remote.id, remote.data.clone()))
                .collect();
            self.storage.add_commits_from_sync(&batch)?;
        }

        if let Some(position) = self.position {
            self.storage
                .set_sync_metadata(SYNC_CURSOR_KEY, Bytes::from(position.into_bytes()))?;
        }
        Ok(())
    }

    fn fetch_object(
        &self,
        hash: &ObjectHash,
        backoff: &mut dyn Backoff,
    ) -> Result<Bytes, SyncError> {
        let mut attempts = 0;
        loop {
            match self.page_cloud.get_object(hash) {
                Ok(bytes) => {
                    backoff.reset();
                    return Ok(bytes);
                }
                Err(err) if err.transience().is_retryable() => {
                    attempts += 1;
                    if attempts >= OBJECT_FETCH_ATTEMPTS {
                        return Err(SyncError::ObjectRetriesExhausted {
                            hash: *hash,
                            attempts,
                        });
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(object = %hash, attempts, "object fetch failed, retrying");
                    sleep(delay);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn sleep(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{FailOp, FakeCloud};
    use crate::cloud::CloudProvider;
    use crate::core::{Commit, PageId, encode_commit};
    use crate::storage::{JournalType, MemoryPageStorage};
    use crate::sync::backoff::TestBackoff;

    fn page() -> PageId {
        PageId::from_bytes([7u8; 16])
    }

    fn make_commit(storage: &MemoryPageStorage, key: &str, value: &[u8]) -> Commit {
        let mut journal = storage
            .start_commit(&CommitId::root(), JournalType::Implicit)
            .unwrap();
        journal.put(key, Bytes::copy_from_slice(value));
        storage.commit_journal(journal).unwrap()
    }

    fn to_remote(storage: &MemoryPageStorage, commit: &Commit) -> (RemoteCommit, Vec<(ObjectHash, Bytes)>) {
        let snapshot = storage.snapshot(&commit.id()).unwrap();
        let encoded = encode_commit(
            commit.parents(),
            commit.generation(),
            commit.timestamp_ms(),
            snapshot.tree(),
            storage.inline_limit(),
        )
        .unwrap();
        (
            RemoteCommit {
                id: commit.id(),
                data: encoded.bytes,
            },
            encoded.objects,
        )
    }

    #[test]
    fn applies_commits_then_persists_cursor() {
        let source = MemoryPageStorage::new(page());
        let commit = make_commit(&source, "k", b"v");
        let (remote, _) = to_remote(&source, &commit);

        let cloud = FakeCloud::new();
        let target: Arc<dyn PageStorage> = Arc::new(MemoryPageStorage::new(page()));
        let position = PositionToken::new(b"1".to_vec());

        let mut backoff = TestBackoff::new(Duration::ZERO);
        BatchDownload::new(
            Arc::clone(&target),
            cloud.page_cloud(&page()),
            vec![remote],
            Some(position.clone()),
        )
        .run(&mut backoff)
        .unwrap();

        assert_eq!(target.head_commit_ids(), vec![commit.id()]);
        assert_eq!(
            target.sync_metadata(SYNC_CURSOR_KEY).unwrap(),
            Some(Bytes::from(position.into_bytes()))
        );
    }

    #[test]
    fn storage_failure_leaves_cursor_untouched() {
        let source = MemoryPageStorage::new(page());
        let commit = make_commit(&source, "k", b"v");
        let (remote, _) = to_remote(&source, &commit);

        let cloud = FakeCloud::new();
        let target = Arc::new(MemoryPageStorage::new(page()));
        target.fail_next_add_commits_from_sync(1);

        let mut backoff = TestBackoff::new(Duration::ZERO);
        let err = BatchDownload::new(
            Arc::clone(&target) as Arc<dyn PageStorage>,
            cloud.page_cloud(&page()),
            vec![remote],
            Some(PositionToken::new(b"1".to_vec())),
        )
        .run(&mut backoff)
        .unwrap_err();

        assert!(err.transience().is_retryable());
        assert_eq!(target.sync_metadata(SYNC_CURSOR_KEY).unwrap(), None);
        assert_eq!(target.head_commit_ids(), vec![CommitId::root()]);
    }

    #[test]
    fn empty_batch_only_advances_cursor() {
        let cloud = FakeCloud::new();
        let target: Arc<dyn PageStorage> = Arc::new(MemoryPageStorage::new(page()));

        let mut backoff = TestBackoff::new(Duration::ZERO);
        BatchDownload::new(
            Arc::clone(&target),
            cloud.page_cloud(&page()),
            Vec::new(),
            Some(PositionToken::new(b"5".to_vec())),
        )
        .run(&mut backoff)
        .unwrap();

        assert_eq!(
            target.sync_metadata(SYNC_CURSOR_KEY).unwrap(),
            Some(Bytes::from_static(b"5"))
        );
    }

    #[test]
    fn fetches_missing_objects_with_retry() {
        let source = MemoryPageStorage::new(page());
        let big = vec![9u8; source.inline_limit() + 1];
        let commit = make_commit(&source, "big", &big);
        let (remote, objects) = to_remote(&source, &commit);
        assert_eq!(objects.len(), 1);

        let cloud = FakeCloud::new();
        let page_cloud = cloud.page_cloud(&page());
        for (hash, bytes) in objects {
            page_cloud.add_object(hash, bytes).unwrap();
        }
        cloud.fail_next(FailOp::GetObject, 2);

        let target: Arc<dyn PageStorage> = Arc::new(MemoryPageStorage::new(page()));
        let mut backoff = TestBackoff::new(Duration::ZERO);
        let counter = backoff.call_counter();
        BatchDownload::new(Arc::clone(&target), page_cloud, vec![remote], None)
            .run(&mut backoff)
            .unwrap();

        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert_eq!(target.head_commit_ids(), vec![commit.id()]);
    }
}
