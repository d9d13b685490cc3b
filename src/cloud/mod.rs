//! Cloud provider contracts.
//!
//! A remote object+commit store with per-page clouds, watch/notify delivery
//! of new remote commits, and a device-set fingerprint endpoint used to
//! detect cloud wipes. Production transports and [`FakeCloud`] implement the
//! same capability traits.

pub mod fake;

use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::Sender;
use thiserror::Error;

use crate::core::{CommitId, Fingerprint, ObjectHash, PageId, PositionToken};
use crate::error::{Effect, Transience};

pub use fake::FakeCloud;

/// A commit record as stored by the cloud: id plus opaque wire bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCommit {
    pub id: CommitId,
    pub data: Bytes,
}

/// Push notification from a page cloud watcher.
#[derive(Clone, Debug)]
pub enum PageCloudEvent {
    NewCommits {
        commits: Vec<RemoteCommit>,
        position: PositionToken,
    },
}

/// Push notification from a device-set fingerprint watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceSetEvent {
    /// The remote cloud instance was wiped since this device last synced.
    Erased,
}

/// Per-page remote commit log and object store.
pub trait PageCloud: Send + Sync {
    /// Append commits to the page's log. Commits already known to the cloud
    /// are skipped.
    fn add_commits(&self, commits: Vec<RemoteCommit>) -> Result<(), CloudError>;

    /// Commits after `min_position`, plus the position token a later call
    /// should resume from. `None` position means read from the beginning.
    fn get_commits(
        &self,
        min_position: Option<&PositionToken>,
    ) -> Result<(Vec<RemoteCommit>, Option<PositionToken>), CloudError>;

    fn add_object(&self, hash: ObjectHash, bytes: Bytes) -> Result<(), CloudError>;

    fn get_object(&self, hash: &ObjectHash) -> Result<Bytes, CloudError>;

    /// Register a watcher delivering commits appended after `min_position`.
    /// Anything already present past that position is delivered immediately.
    fn set_watcher(
        &self,
        min_position: Option<&PositionToken>,
        watcher: Sender<PageCloudEvent>,
    ) -> Result<(), CloudError>;
}

/// Device-set fingerprint endpoint, shared by all pages of a user.
pub trait DeviceSet: Send + Sync {
    /// Ok when the fingerprint is still known to the cloud; `Erased` when it
    /// is gone, i.e. the remote store was wiped since it was set.
    fn check_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), CloudError>;

    fn set_fingerprint(&self, fingerprint: Fingerprint) -> Result<(), CloudError>;

    /// Wipe the remote store: all fingerprints and all page data.
    fn erase_all_fingerprints(&self) -> Result<(), CloudError>;

    fn watch_fingerprint(
        &self,
        fingerprint: Fingerprint,
        watcher: Sender<DeviceSetEvent>,
    ) -> Result<(), CloudError>;
}

/// Factory handing out the per-page clouds and the device set of one user.
pub trait CloudProvider: Send + Sync {
    fn page_cloud(&self, page: &PageId) -> Arc<dyn PageCloud>;
    fn device_set(&self) -> Arc<dyn DeviceSet>;
}

/// Errors reported across the cloud boundary.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CloudError {
    #[error("cloud network error: {0}")]
    Network(String),

    #[error("not found in cloud")]
    NotFound,

    #[error("remote store was erased")]
    Erased,

    #[error("cloud internal error: {0}")]
    Internal(String),
}

impl CloudError {
    pub fn transience(&self) -> Transience {
        match self {
            CloudError::Network(_) => Transience::Retryable,
            CloudError::NotFound | CloudError::Erased | CloudError::Internal(_) => {
                Transience::Permanent
            }
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // A network failure may have landed on the server anyway.
            CloudError::Network(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
