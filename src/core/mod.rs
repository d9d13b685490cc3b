//! Core domain types for folio.
//!
//! Module hierarchy follows type dependency order:
//! - ids: content hashes and random identities
//! - clock: monotonic wall clock for commit timestamps
//! - commit: commits, trees, head ordering
//! - wire: the CBOR commit format exchanged with the cloud

pub mod clock;
pub mod commit;
pub mod error;
pub mod ids;
pub mod wire;

pub use clock::Clock;
pub use commit::{Commit, Entry, Tree, commit_id, object_hash, tree_hash};
pub use error::CoreError;
pub use ids::{CommitId, Fingerprint, ObjectHash, PageId, PositionToken, RepositoryName};
pub use wire::{EncodedCommit, WireCommit, WireValue, decode_commit, encode_commit};
