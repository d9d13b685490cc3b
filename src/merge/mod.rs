//! Conflict detection and resolution.
//!
//! Provides:
//! - MergeResolver: per-page state machine watching the head-commit set
//! - LastOneWinsStrategy: automatic three-way merge favoring the newer head
//! - CustomMergeStrategy: hands conflicts to an application resolver through
//!   a MergeResultProvider session
//! - ancestor/diff: common-version computation and three-way diffs

pub mod ancestor;
pub mod custom;
pub mod diff;
pub mod last_one_wins;
pub mod resolver;
pub mod session;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{Commit, CommitId};
use crate::error::{Effect, Transience};
use crate::storage::{PageSnapshot, PageStorage, StorageError};

pub use ancestor::common_ancestor;
pub use custom::CustomMergeStrategy;
pub use diff::{DiffEntry, DiffToken, three_way_diff};
pub use last_one_wins::LastOneWinsStrategy;
pub use resolver::MergeResolver;
pub use session::MergeResultProvider;

/// Errors from merge sessions and strategies.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MergeError {
    #[error("merge decision references unknown key: {0:?}")]
    KeyNotFound(String),

    #[error("invalid merge decision for key {key:?}: {reason}")]
    InvalidDecision { key: String, reason: &'static str },

    #[error("merge session is disconnected")]
    Disconnected,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MergeError {
    pub fn transience(&self) -> Transience {
        match self {
            MergeError::Storage(e) => e.transience(),
            MergeError::KeyNotFound(_)
            | MergeError::InvalidDecision { .. }
            | MergeError::Disconnected => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            MergeError::Storage(e) => e.effect(),
            _ => Effect::None,
        }
    }
}

/// Which side's value an explicit merge decision takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueSource {
    Left,
    Right,
    /// An explicitly supplied new value.
    New,
    Delete,
}

/// One explicit per-key merge decision.
#[derive(Clone, Debug)]
pub struct MergedValue {
    pub key: String,
    pub source: ValueSource,
    pub new_value: Option<Bytes>,
}

/// Outcome reported to no-conflict waiters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictResolutionWaitStatus {
    /// No conflict existed when the waiter was registered.
    NoConflicts,
    /// A conflict existed and has since been resolved.
    ConflictsResolved,
}

/// How a merge session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Merged(CommitId),
    Failed { retryable: bool },
}

/// Hook the resolver installs to learn a pending session's outcome.
pub type SettledHook = Box<dyn FnOnce(SessionOutcome) + Send>;

/// What a strategy's `merge` call produced.
pub enum StrategyOutcome {
    /// The merge commit exists; the head set has collapsed.
    Merged,
    /// A session was handed to an external resolver; the outcome arrives
    /// through the settled hook. The handle lets the resolver cancel it.
    Pending(session::SessionHandle),
}

/// Everything a strategy needs to resolve one conflict.
pub struct MergeContext {
    pub storage: Arc<dyn PageStorage>,
    /// The newer head under (generation, timestamp, id) ordering.
    pub left: Commit,
    /// The older head.
    pub right: Commit,
    /// Lowest common ancestor of the two heads.
    pub ancestor: Commit,
    on_settled: Option<SettledHook>,
}

impl MergeContext {
    pub(crate) fn new(
        storage: Arc<dyn PageStorage>,
        left: Commit,
        right: Commit,
        ancestor: Commit,
        on_settled: SettledHook,
    ) -> Self {
        Self {
            storage,
            left,
            right,
            ancestor,
            on_settled: Some(on_settled),
        }
    }

    /// Take the settled hook; pending strategies wire it into their session.
    pub fn take_settled_hook(&mut self) -> Option<SettledHook> {
        self.on_settled.take()
    }
}

/// Pluggable policy invoked whenever multiple heads exist.
pub trait MergeStrategy: Send {
    fn merge(&mut self, ctx: MergeContext) -> Result<StrategyOutcome, MergeError>;

    /// Called when an in-flight merge is abandoned (strategy swap).
    fn cancel(&mut self);
}

/// An application-supplied conflict resolver.
///
/// Receives the two conflicting versions plus their common ancestor, and a
/// result provider through which it reports per-key decisions and `done`.
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        left: PageSnapshot,
        right: PageSnapshot,
        common_version: PageSnapshot,
        result_provider: MergeResultProvider,
    );
}
