//! Page storage contracts.
//!
//! The sync and merge engines only ever talk to storage through the
//! [`PageStorage`] capability trait; [`MemoryPageStorage`] is the
//! implementation this crate ships (the durable B-tree store behind the same
//! contract is a separate subsystem).

pub mod journal;
pub mod memory;
pub mod snapshot;

use std::sync::Weak;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{Commit, CommitId, CoreError, ObjectHash, PageId};
use crate::error::{Effect, Transience};

pub use journal::{Journal, JournalType};
pub use memory::MemoryPageStorage;
pub use snapshot::PageSnapshot;

/// Well-known sync-metadata key under which the cloud position token is
/// persisted.
pub const SYNC_CURSOR_KEY: &str = "timestamp";

/// Where a batch of new commits came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitSource {
    Local,
    Sync,
}

/// Observer of new commits appearing in storage.
///
/// Notified after the head set has been updated, outside storage locks, so
/// implementations may call back into storage.
pub trait CommitWatcher: Send + Sync {
    fn on_new_commits(&self, commits: &[Commit], source: CommitSource);
}

/// Commit/object CRUD, journal-based mutation and head tracking for one page.
///
/// All operations are single-outcome: they either fully succeed or report an
/// error with nothing applied.
pub trait PageStorage: Send + Sync {
    fn page_id(&self) -> PageId;

    /// Open a journal staging changes on top of `parent`.
    fn start_commit(&self, parent: &CommitId, journal_type: JournalType)
    -> Result<Journal, StorageError>;

    /// Open a journal for a merge commit. `left` is the base the journal's
    /// staged operations apply to.
    fn start_merge_commit(
        &self,
        left: &CommitId,
        right: &CommitId,
    ) -> Result<Journal, StorageError>;

    /// Atomically turn a journal into a commit and update the head set.
    fn commit_journal(&self, journal: Journal) -> Result<Commit, StorageError>;

    /// Current heads, ordered oldest to newest by (generation, timestamp, id).
    fn head_commit_ids(&self) -> Vec<CommitId>;

    fn commit(&self, id: &CommitId) -> Result<Commit, StorageError>;

    /// A shared view of a commit's contents, alive independently of storage.
    fn snapshot(&self, id: &CommitId) -> Result<PageSnapshot, StorageError>;

    /// Atomically apply a batch of remote commits in cloud order.
    ///
    /// Re-adding an already-present commit is a no-op; any invalid commit
    /// fails the whole batch with nothing applied.
    fn add_commits_from_sync(&self, batch: &[(CommitId, Bytes)]) -> Result<(), StorageError>;

    fn sync_metadata(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    fn set_sync_metadata(&self, key: &str, value: Bytes) -> Result<(), StorageError>;

    /// Locally created commits not yet acknowledged by the cloud, parents
    /// before children.
    fn unsynced_commits(&self) -> Vec<Commit>;

    fn mark_commit_synced(&self, id: &CommitId) -> Result<(), StorageError>;

    fn has_object(&self, hash: &ObjectHash) -> bool;

    fn object(&self, hash: &ObjectHash) -> Result<Bytes, StorageError>;

    /// Store a value object fetched from the cloud ahead of the commits that
    /// reference it.
    fn add_object_from_sync(&self, hash: ObjectHash, bytes: Bytes) -> Result<(), StorageError>;

    fn register_commit_watcher(&self, watcher: Weak<dyn CommitWatcher>);
}

/// Errors reported by page storage.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    #[error("commit not found: {0}")]
    CommitNotFound(CommitId),

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectHash),

    #[error("commit {commit} references unknown parent {parent}")]
    UnknownParent { commit: CommitId, parent: CommitId },

    #[error("commit {claimed} does not match its content: computed {computed}")]
    IdMismatch { claimed: CommitId, computed: CommitId },

    #[error("object {claimed} does not match its content: computed {computed}")]
    ObjectHashMismatch {
        claimed: ObjectHash,
        computed: ObjectHash,
    },

    #[error("invalid commit {commit}: {reason}")]
    InvalidCommit { commit: CommitId, reason: String },

    #[error("storage io failed: {reason}")]
    Io { reason: String },

    #[error(transparent)]
    Decode(#[from] CoreError),
}

impl StorageError {
    pub fn transience(&self) -> Transience {
        match self {
            StorageError::Io { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // Io can strike mid-apply; everything else fails during
            // validation, before any state changes.
            StorageError::Io { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
