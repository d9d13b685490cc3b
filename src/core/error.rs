//! Core error types.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Errors from the core data model: identity parsing and wire codec.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("invalid {kind} identifier: {reason}")]
    InvalidId { kind: &'static str, reason: String },

    #[error("commit encode failed: {0}")]
    Encode(String),

    #[error("commit decode failed: {0}")]
    Decode(String),
}

impl CoreError {
    /// Whether retrying may succeed. Malformed data never fixes itself.
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
