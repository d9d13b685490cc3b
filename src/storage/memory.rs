//! In-memory page storage.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::core::{
    Clock, Commit, CommitId, ObjectHash, PageId, Tree, decode_commit, object_hash, tree_hash,
};

use super::journal::{Journal, JournalType};
use super::snapshot::PageSnapshot;
use super::{CommitSource, CommitWatcher, PageStorage, StorageError};

/// Values larger than this are offloaded to the object store instead of
/// traveling inline in the commit record.
pub const DEFAULT_INLINE_VALUE_LIMIT: usize = 256;

type HeadKey = (u64, u64, CommitId);

/// The in-memory implementation of [`PageStorage`].
pub struct MemoryPageStorage {
    page_id: PageId,
    inline_limit: usize,
    inner: Mutex<Inner>,
    watchers: Mutex<Vec<Weak<dyn CommitWatcher>>>,
}

struct Inner {
    commits: HashMap<CommitId, Commit>,
    trees: HashMap<ObjectHash, Arc<Tree>>,
    objects: HashMap<ObjectHash, Bytes>,
    heads: BTreeSet<HeadKey>,
    children: HashMap<CommitId, u32>,
    metadata: HashMap<String, Bytes>,
    unsynced: BTreeSet<HeadKey>,
    clock: Clock,
    fail_next_sync: u32,
    fail_next_journal: u32,
}

impl MemoryPageStorage {
    pub fn new(page_id: PageId) -> Self {
        Self::with_inline_limit(page_id, DEFAULT_INLINE_VALUE_LIMIT)
    }

    pub fn with_inline_limit(page_id: PageId, inline_limit: usize) -> Self {
        let root = Commit::root();
        let mut commits = HashMap::new();
        let mut trees = HashMap::new();
        let mut heads = BTreeSet::new();
        heads.insert(root.order_key());
        trees.insert(root.root_hash(), Arc::new(Tree::new()));
        commits.insert(root.id(), root);

        Self {
            page_id,
            inline_limit,
            inner: Mutex::new(Inner {
                commits,
                trees,
                objects: HashMap::new(),
                heads,
                children: HashMap::new(),
                metadata: HashMap::new(),
                unsynced: BTreeSet::new(),
                clock: Clock::new(),
                fail_next_sync: 0,
                fail_next_journal: 0,
            }),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn inline_limit(&self) -> usize {
        self.inline_limit
    }

    /// Fault injection: fail the next `n` `add_commits_from_sync` calls.
    pub fn fail_next_add_commits_from_sync(&self, n: u32) {
        self.lock().fail_next_sync = n;
    }

    /// Fault injection: fail the next `n` `commit_journal` calls.
    pub fn fail_next_commit_journal(&self, n: u32) {
        self.lock().fail_next_journal = n;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("storage lock poisoned")
    }

    fn notify(&self, commits: &[Commit], source: CommitSource) {
        if commits.is_empty() {
            return;
        }
        let live: Vec<Arc<dyn CommitWatcher>> = {
            let mut watchers = self.watchers.lock().expect("watcher lock poisoned");
            watchers.retain(|w| w.strong_count() > 0);
            watchers.iter().filter_map(Weak::upgrade).collect()
        };
        for watcher in live {
            watcher.on_new_commits(commits, source);
        }
    }
}

impl Inner {
    fn injected_fault(counter: &mut u32) -> Result<(), StorageError> {
        if *counter > 0 {
            *counter -= 1;
            return Err(StorageError::Io {
                reason: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn tree_of(&self, commit: &Commit) -> Arc<Tree> {
        self.trees
            .get(&commit.root_hash())
            .cloned()
            .expect("every stored commit has its tree")
    }

    /// Insert a validated commit and maintain heads/children/unsynced.
    fn apply_commit(&mut self, commit: Commit, tree: Tree, from_sync: bool) {
        self.trees
            .entry(commit.root_hash())
            .or_insert_with(|| Arc::new(tree));

        for parent in commit.parents().to_vec() {
            *self.children.entry(parent).or_default() += 1;
            if let Some(parent_commit) = self.commits.get(&parent) {
                self.heads.remove(&parent_commit.order_key());
            }
        }

        let key = commit.order_key();
        let id = commit.id();
        self.commits.insert(id, commit);
        if self.children.get(&id).copied().unwrap_or(0) == 0 {
            self.heads.insert(key);
        }
        if !from_sync {
            self.unsynced.insert(key);
        }
    }
}

impl PageStorage for MemoryPageStorage {
    fn page_id(&self) -> PageId {
        self.page_id
    }

    fn start_commit(
        &self,
        parent: &CommitId,
        journal_type: JournalType,
    ) -> Result<Journal, StorageError> {
        let inner = self.lock();
        let commit = inner
            .commits
            .get(parent)
            .ok_or(StorageError::CommitNotFound(*parent))?;
        let base = inner.tree_of(commit);
        Ok(Journal::new(journal_type, vec![*parent], base))
    }

    fn start_merge_commit(
        &self,
        left: &CommitId,
        right: &CommitId,
    ) -> Result<Journal, StorageError> {
        if left == right {
            return Err(StorageError::InvalidCommit {
                commit: *left,
                reason: "merge parents must differ".to_string(),
            });
        }
        let inner = self.lock();
        let left_commit = inner
            .commits
            .get(left)
            .ok_or(StorageError::CommitNotFound(*left))?;
        if !inner.commits.contains_key(right) {
            return Err(StorageError::CommitNotFound(*right));
        }
        let base = inner.tree_of(left_commit);
        Ok(Journal::new(
            JournalType::Implicit,
            vec![*left, *right],
            base,
        ))
    }

    fn commit_journal(&self, journal: Journal) -> Result<Commit, StorageError> {
        let commit = {
            let mut inner = self.lock();
            Inner::injected_fault(&mut inner.fail_next_journal)?;

            let tree = journal.build_tree();
            let parents = journal.parents().to_vec();
            let mut max_generation = 0;
            let mut max_timestamp = 0;
            for parent in &parents {
                let parent_commit = inner
                    .commits
                    .get(parent)
                    .ok_or(StorageError::CommitNotFound(*parent))?;
                max_generation = max_generation.max(parent_commit.generation());
                max_timestamp = max_timestamp.max(parent_commit.timestamp_ms());
            }

            // Merge commits take the max parent timestamp so every device
            // constructs the identical merge for the same parents and tree.
            let timestamp_ms = if parents.len() == 2 {
                max_timestamp
            } else {
                inner.clock.tick()
            };

            let root = tree_hash(&tree);
            let commit = Commit::new(parents, max_generation + 1, timestamp_ms, root);

            if let Some(existing) = inner.commits.get(&commit.id()) {
                // Content-addressed: recreating an existing commit is a no-op.
                return Ok(existing.clone());
            }

            for (_, value) in tree.iter() {
                if value.len() > self.inline_limit {
                    inner
                        .objects
                        .entry(object_hash(value))
                        .or_insert_with(|| value.clone());
                }
            }

            inner.apply_commit(commit.clone(), tree, false);
            commit
        };

        self.notify(std::slice::from_ref(&commit), CommitSource::Local);
        Ok(commit)
    }

    fn head_commit_ids(&self) -> Vec<CommitId> {
        self.lock().heads.iter().map(|(_, _, id)| *id).collect()
    }

    fn commit(&self, id: &CommitId) -> Result<Commit, StorageError> {
        self.lock()
            .commits
            .get(id)
            .cloned()
            .ok_or(StorageError::CommitNotFound(*id))
    }

    fn snapshot(&self, id: &CommitId) -> Result<PageSnapshot, StorageError> {
        let inner = self.lock();
        let commit = inner
            .commits
            .get(id)
            .cloned()
            .ok_or(StorageError::CommitNotFound(*id))?;
        let tree = inner.tree_of(&commit);
        Ok(PageSnapshot::new(commit, tree))
    }

    fn add_commits_from_sync(&self, batch: &[(CommitId, Bytes)]) -> Result<(), StorageError> {
        let mut decoded = Vec::with_capacity(batch.len());
        for (id, bytes) in batch {
            decoded.push((*id, decode_commit(bytes)?));
        }

        let added = {
            let mut inner = self.lock();
            Inner::injected_fault(&mut inner.fail_next_sync)?;

            // Validate the whole batch before applying anything: one bad
            // commit aborts the batch with storage untouched.
            let mut pending: Vec<(Commit, Tree)> = Vec::new();
            let mut pending_index: HashMap<CommitId, usize> = HashMap::new();
            for (claimed, wire) in decoded {
                if inner.commits.contains_key(&claimed) || pending_index.contains_key(&claimed) {
                    continue;
                }

                let mut max_generation = 0;
                for parent in &wire.parents {
                    let generation = inner
                        .commits
                        .get(parent)
                        .map(Commit::generation)
                        .or_else(|| {
                            pending_index
                                .get(parent)
                                .map(|i| pending[*i].0.generation())
                        })
                        .ok_or(StorageError::UnknownParent {
                            commit: claimed,
                            parent: *parent,
                        })?;
                    max_generation = max_generation.max(generation);
                }
                if wire.generation != max_generation + 1 {
                    return Err(StorageError::InvalidCommit {
                        commit: claimed,
                        reason: format!(
                            "generation {} does not follow parents (expected {})",
                            wire.generation,
                            max_generation + 1
                        ),
                    });
                }

                let tree = wire
                    .resolve_tree(|hash| inner.objects.get(hash).cloned())
                    .map_err(StorageError::ObjectNotFound)?;
                let root = tree_hash(&tree);
                let commit = Commit::new(
                    wire.parents.clone(),
                    wire.generation,
                    wire.timestamp_ms,
                    root,
                );
                if commit.id() != claimed {
                    return Err(StorageError::IdMismatch {
                        claimed,
                        computed: commit.id(),
                    });
                }

                pending_index.insert(claimed, pending.len());
                pending.push((commit, tree));
            }

            let mut added = Vec::with_capacity(pending.len());
            for (commit, tree) in pending {
                inner.clock.observe(commit.timestamp_ms());
                inner.apply_commit(commit.clone(), tree, true);
                added.push(commit);
            }
            added
        };

        self.notify(&added, CommitSource::Sync);
        Ok(())
    }

    fn sync_metadata(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.lock().metadata.get(key).cloned())
    }

    fn set_sync_metadata(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        self.lock().metadata.insert(key.to_string(), value);
        Ok(())
    }

    fn unsynced_commits(&self) -> Vec<Commit> {
        let inner = self.lock();
        inner
            .unsynced
            .iter()
            .filter_map(|(_, _, id)| inner.commits.get(id).cloned())
            .collect()
    }

    fn mark_commit_synced(&self, id: &CommitId) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let key = inner
            .commits
            .get(id)
            .map(Commit::order_key)
            .ok_or(StorageError::CommitNotFound(*id))?;
        inner.unsynced.remove(&key);
        Ok(())
    }

    fn has_object(&self, hash: &ObjectHash) -> bool {
        self.lock().objects.contains_key(hash)
    }

    fn object(&self, hash: &ObjectHash) -> Result<Bytes, StorageError> {
        self.lock()
            .objects
            .get(hash)
            .cloned()
            .ok_or(StorageError::ObjectNotFound(*hash))
    }

    fn add_object_from_sync(&self, hash: ObjectHash, bytes: Bytes) -> Result<(), StorageError> {
        let computed = object_hash(&bytes);
        if computed != hash {
            return Err(StorageError::ObjectHashMismatch {
                claimed: hash,
                computed,
            });
        }
        self.lock().objects.insert(hash, bytes);
        Ok(())
    }

    fn register_commit_watcher(&self, watcher: Weak<dyn CommitWatcher>) {
        self.watchers
            .lock()
            .expect("watcher lock poisoned")
            .push(watcher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::encode_commit;

    fn storage() -> MemoryPageStorage {
        MemoryPageStorage::new(PageId::from_bytes([1u8; 16]))
    }

    fn put_commit(storage: &MemoryPageStorage, parent: &CommitId, key: &str, value: &str) -> Commit {
        let mut journal = storage.start_commit(parent, JournalType::Implicit).unwrap();
        journal.put(key, Bytes::copy_from_slice(value.as_bytes()));
        storage.commit_journal(journal).unwrap()
    }

    fn wire_bytes(storage: &MemoryPageStorage, commit: &Commit) -> (CommitId, Bytes) {
        let snapshot = storage.snapshot(&commit.id()).unwrap();
        let encoded = encode_commit(
            commit.parents(),
            commit.generation(),
            commit.timestamp_ms(),
            snapshot.tree(),
            storage.inline_limit(),
        )
        .unwrap();
        (commit.id(), encoded.bytes)
    }

    #[test]
    fn starts_with_single_root_head() {
        let storage = storage();
        assert_eq!(storage.head_commit_ids(), vec![CommitId::root()]);
    }

    #[test]
    fn concurrent_commits_create_two_heads() {
        let storage = storage();
        let a = put_commit(&storage, &CommitId::root(), "foo", "bar");
        let b = put_commit(&storage, &CommitId::root(), "foo", "baz");

        let heads = storage.head_commit_ids();
        assert_eq!(heads.len(), 2);
        assert!(heads.contains(&a.id()));
        assert!(heads.contains(&b.id()));
    }

    #[test]
    fn merge_commit_collapses_heads() {
        let storage = storage();
        let a = put_commit(&storage, &CommitId::root(), "a", "1");
        let b = put_commit(&storage, &CommitId::root(), "b", "2");

        let journal = storage.start_merge_commit(&a.id(), &b.id()).unwrap();
        let merge = storage.commit_journal(journal).unwrap();

        assert_eq!(storage.head_commit_ids(), vec![merge.id()]);
        assert!(merge.is_merge());
        assert_eq!(merge.generation(), 2);
        assert_eq!(
            merge.timestamp_ms(),
            a.timestamp_ms().max(b.timestamp_ms())
        );
    }

    #[test]
    fn duplicate_journal_result_is_a_noop() {
        let storage = storage();
        let a = put_commit(&storage, &CommitId::root(), "a", "1");
        let b = put_commit(&storage, &CommitId::root(), "b", "2");

        let first = storage
            .commit_journal(storage.start_merge_commit(&a.id(), &b.id()).unwrap())
            .unwrap();
        let second = storage
            .commit_journal(storage.start_merge_commit(&a.id(), &b.id()).unwrap())
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(storage.head_commit_ids(), vec![first.id()]);
    }

    #[test]
    fn sync_apply_is_idempotent() {
        let source = storage();
        let commit = put_commit(&source, &CommitId::root(), "k", "v");
        let batch = vec![wire_bytes(&source, &commit)];

        let target = storage();
        target.add_commits_from_sync(&batch).unwrap();
        target.add_commits_from_sync(&batch).unwrap();

        assert_eq!(target.head_commit_ids(), vec![commit.id()]);
        let snapshot = target.snapshot(&commit.id()).unwrap();
        assert_eq!(snapshot.get("k"), Some(Bytes::from_static(b"v")));
        // Synced commits are not scheduled for upload.
        assert!(target.unsynced_commits().is_empty());
    }

    #[test]
    fn sync_apply_rejects_unknown_parent_atomically() {
        let source = storage();
        let first = put_commit(&source, &CommitId::root(), "k", "v");
        let second = put_commit(&source, &first.id(), "k", "w");

        // Ship only the child: its parent is unknown to the target.
        let target = storage();
        let err = target
            .add_commits_from_sync(&[wire_bytes(&source, &second)])
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownParent { .. }));
        assert_eq!(target.head_commit_ids(), vec![CommitId::root()]);
    }

    #[test]
    fn sync_apply_rejects_tampered_payload() {
        let source = storage();
        let commit = put_commit(&source, &CommitId::root(), "k", "v");
        let (_, bytes) = wire_bytes(&source, &commit);

        let target = storage();
        let bogus_id = CommitId::from_bytes([0xAB; 32]);
        let err = target
            .add_commits_from_sync(&[(bogus_id, bytes)])
            .unwrap_err();
        assert!(matches!(err, StorageError::IdMismatch { .. }));
    }

    #[test]
    fn large_values_are_offloaded_and_required_on_sync() {
        let source = storage();
        let big = "x".repeat(DEFAULT_INLINE_VALUE_LIMIT + 1);
        let commit = put_commit(&source, &CommitId::root(), "big", &big);
        let batch = vec![wire_bytes(&source, &commit)];
        let hash = object_hash(big.as_bytes());
        assert!(source.has_object(&hash));

        let target = storage();
        let err = target.add_commits_from_sync(&batch).unwrap_err();
        assert!(matches!(err, StorageError::ObjectNotFound(h) if h == hash));

        target
            .add_object_from_sync(hash, source.object(&hash).unwrap())
            .unwrap();
        target.add_commits_from_sync(&batch).unwrap();
        assert_eq!(
            target.snapshot(&commit.id()).unwrap().get("big"),
            Some(Bytes::from(big.into_bytes()))
        );
    }

    #[test]
    fn unsynced_commits_order_parents_first() {
        let storage = storage();
        let first = put_commit(&storage, &CommitId::root(), "a", "1");
        let second = put_commit(&storage, &first.id(), "b", "2");

        let unsynced: Vec<CommitId> = storage.unsynced_commits().iter().map(Commit::id).collect();
        assert_eq!(unsynced, vec![first.id(), second.id()]);

        storage.mark_commit_synced(&first.id()).unwrap();
        let unsynced: Vec<CommitId> = storage.unsynced_commits().iter().map(Commit::id).collect();
        assert_eq!(unsynced, vec![second.id()]);
    }

    #[test]
    fn sync_metadata_round_trips() {
        let storage = storage();
        assert_eq!(storage.sync_metadata("timestamp").unwrap(), None);
        storage
            .set_sync_metadata("timestamp", Bytes::from_static(b"42"))
            .unwrap();
        assert_eq!(
            storage.sync_metadata("timestamp").unwrap(),
            Some(Bytes::from_static(b"42"))
        );
    }

    #[test]
    fn injected_fault_fails_once_then_recovers() {
        let source = storage();
        let commit = put_commit(&source, &CommitId::root(), "k", "v");
        let batch = vec![wire_bytes(&source, &commit)];

        let target = storage();
        target.fail_next_add_commits_from_sync(1);
        let err = target.add_commits_from_sync(&batch).unwrap_err();
        assert!(err.transience().is_retryable());

        target.add_commits_from_sync(&batch).unwrap();
        assert_eq!(target.head_commit_ids(), vec![commit.id()]);
    }

    #[test]
    fn watchers_see_sources() {
        struct Recorder(Mutex<Vec<(usize, CommitSource)>>);
        impl CommitWatcher for Recorder {
            fn on_new_commits(&self, commits: &[Commit], source: CommitSource) {
                self.0
                    .lock()
                    .unwrap()
                    .push((commits.len(), source));
            }
        }

        let storage = storage();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let recorder_dyn: Arc<dyn CommitWatcher> = recorder.clone();
        let as_watcher: Weak<dyn CommitWatcher> = Arc::downgrade(&recorder_dyn);
        storage.register_commit_watcher(as_watcher);

        let local = put_commit(&storage, &CommitId::root(), "k", "v");

        let other = self::storage();
        let remote = put_commit(&other, &CommitId::root(), "r", "1");
        storage
            .add_commits_from_sync(&[wire_bytes(&other, &remote)])
            .unwrap();

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(1, CommitSource::Local), (1, CommitSource::Sync)]
        );
        let _ = local;
    }
}
