//! Cloud synchronization pipeline.
//!
//! Provides:
//! - Backoff policies for transient-failure retry
//! - BatchDownload: atomic apply of a remote commit batch plus cursor persist
//! - PageDownload / PageUpload: per-direction state machines
//! - SyncWatcherSet: fan-out of (download, upload) state to observers
//! - UserSync: per-repository orchestration and cloud-erasure detection

pub mod backoff;
pub mod batch_download;
pub mod page_download;
pub mod page_sync;
pub mod page_upload;
pub mod state;
pub mod user_sync;
pub mod watcher_set;

use thiserror::Error;

use crate::cloud::CloudError;
use crate::core::{CoreError, ObjectHash};
use crate::error::{Effect, Transience};
use crate::storage::StorageError;

pub use backoff::{Backoff, ExponentialBackoff, TestBackoff};
pub use batch_download::BatchDownload;
pub use page_download::PageDownload;
pub use page_sync::PageSync;
pub use page_upload::PageUpload;
pub use state::{DownloadState, SyncState, SyncStatePair, SyncStateTracker, UploadState};
pub use user_sync::UserSync;
pub use watcher_set::{SyncWatcherHandle, SyncWatcherSet};

/// Errors from the sync pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Decode(#[from] CoreError),

    #[error("object {hash} fetch failed after {attempts} attempts")]
    ObjectRetriesExhausted { hash: ObjectHash, attempts: u32 },
}

impl SyncError {
    pub fn transience(&self) -> Transience {
        match self {
            SyncError::Cloud(e) => e.transience(),
            SyncError::Storage(e) => e.transience(),
            SyncError::Decode(e) => e.transience(),
            SyncError::ObjectRetriesExhausted { .. } => Transience::Retryable,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            SyncError::Cloud(e) => e.effect(),
            SyncError::Storage(e) => e.effect(),
            SyncError::Decode(e) => e.effect(),
            SyncError::ObjectRetriesExhausted { .. } => Effect::None,
        }
    }
}
