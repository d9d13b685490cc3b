//! Identity atoms.
//!
//! CommitId / ObjectHash: 32-byte content hashes.
//! PageId / RepositoryName / Fingerprint: 16-byte random identities.
//! PositionToken: opaque cloud-assigned sync cursor.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::CoreError;

fn hex32(bytes: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Commit identifier: SHA-256 of the commit's canonical identity encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitId([u8; 32]);

impl CommitId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Id of the implicit empty first commit every page starts from.
    pub fn root() -> Self {
        Self([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CoreError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CoreError::InvalidId {
            kind: "commit",
            reason: format!("expected 32 bytes, got {}", slice.len()),
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex32(&self.0)
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Content hash of a value object or of a tree's canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CoreError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CoreError::InvalidId {
            kind: "object",
            reason: format!("expected 32 bytes, got {}", slice.len()),
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex32(&self.0)
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Page identifier within a repository.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(Uuid);

impl PageId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn random() -> Self {
        Self(Uuid::from_bytes(random_bytes16()))
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", self.0.simple())
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Stable repository identity.
///
/// Derived from the repository's content directory: read from the `name`
/// file when present, generated and persisted otherwise. The same on-disk
/// path resolves to the same logical repository across process restarts.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryName(Uuid);

impl RepositoryName {
    pub fn random() -> Self {
        Self(Uuid::from_bytes(random_bytes16()))
    }

    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }

    pub fn parse_hex(s: &str) -> Result<Self, CoreError> {
        let uuid = Uuid::try_parse(s.trim()).map_err(|e| CoreError::InvalidId {
            kind: "repository name",
            reason: e.to_string(),
        })?;
        Ok(Self(uuid))
    }
}

impl fmt::Debug for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepositoryName({})", self.0.simple())
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Per-device marker checked against the cloud to detect remote erasure.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Uuid);

impl Fingerprint {
    pub fn random() -> Self {
        Self(Uuid::from_bytes(random_bytes16()))
    }

    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }

    pub fn parse_hex(s: &str) -> Result<Self, CoreError> {
        let uuid = Uuid::try_parse(s.trim()).map_err(|e| CoreError::InvalidId {
            kind: "fingerprint",
            reason: e.to_string(),
        })?;
        Ok(Self(uuid))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.0.simple())
    }
}

/// Opaque, cloud-assigned marker for how much of the remote commit stream
/// has been consumed.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct PositionToken(Vec<u8>);

impl PositionToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PositionToken({})", String::from_utf8_lossy(&self.0))
    }
}

fn random_bytes16() -> [u8; 16] {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_id_round_trips_through_slice() {
        let id = CommitId::from_bytes([7u8; 32]);
        let back = CommitId::from_slice(id.as_bytes()).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn commit_id_rejects_wrong_length() {
        assert!(CommitId::from_slice(&[1u8; 16]).is_err());
    }

    #[test]
    fn repository_name_round_trips_through_hex() {
        let name = RepositoryName::random();
        let parsed = RepositoryName::parse_hex(&name.to_hex()).unwrap();
        assert_eq!(name, parsed);
    }

    #[test]
    fn repository_name_hex_tolerates_whitespace() {
        let name = RepositoryName::random();
        let parsed = RepositoryName::parse_hex(&format!("{}\n", name.to_hex())).unwrap();
        assert_eq!(name, parsed);
    }
}
