//! Repository lifecycle: containers, factory, erasure recovery.

pub mod container;
pub mod factory;
pub mod repository;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::CoreError;
use crate::error::{Effect, Transience};

pub use container::{BindTicket, RepositoryContainer};
pub use factory::RepositoryFactory;
pub use repository::{LedgerRepository, PageRuntime, RepositoryHandle};

/// Errors from the repository layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RepositoryError {
    /// The repository was detached (cloud erasure recovery); callers must
    /// treat this like any other closed connection and reopen.
    #[error("repository is detached")]
    Detached,

    #[error("repository initialization failed: {reason}")]
    InitializationFailed { reason: String },

    #[error("repository io failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Name(#[from] CoreError),
}

impl RepositoryError {
    pub fn transience(&self) -> Transience {
        match self {
            RepositoryError::Io { .. } => Transience::Retryable,
            RepositoryError::Detached
            | RepositoryError::InitializationFailed { .. }
            | RepositoryError::Name(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            RepositoryError::Io { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
