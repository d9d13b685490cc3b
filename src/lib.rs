#![forbid(unsafe_code)]

pub mod cloud;
pub mod config;
pub mod core;
pub mod error;
pub mod merge;
mod paths;
pub mod repository;
pub mod storage;
pub mod sync;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    Commit, CommitId, Entry, Fingerprint, ObjectHash, PageId, PositionToken, RepositoryName, Tree,
};
pub use crate::merge::{
    ConflictResolutionWaitStatus, ConflictResolver, DiffEntry, LastOneWinsStrategy, MergeResolver,
    MergeResultProvider, MergeStrategy, MergedValue, ValueSource,
};
pub use crate::repository::{LedgerRepository, RepositoryFactory, RepositoryHandle};
pub use crate::storage::{CommitSource, Journal, MemoryPageStorage, PageSnapshot, PageStorage};
pub use crate::sync::{SyncState, SyncStatePair, SyncWatcherHandle};
