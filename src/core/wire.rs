//! CBOR wire format for commits exchanged with the cloud.
//!
//! Values up to an inline threshold travel inside the commit record; larger
//! values are replaced by their content hash and uploaded/fetched separately
//! through the cloud object endpoints.

use bytes::Bytes;

use super::commit::{Tree, object_hash};
use super::error::CoreError;
use super::ids::{CommitId, ObjectHash};

const WIRE_VERSION: u32 = 1;

const KIND_INLINE: u8 = 0;
const KIND_OBJECT: u8 = 1;

/// An entry value as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireValue {
    Inline(Bytes),
    Object(ObjectHash),
}

/// A decoded remote commit, before its tree is materialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireCommit {
    pub parents: Vec<CommitId>,
    pub generation: u64,
    pub timestamp_ms: u64,
    pub values: Vec<(String, WireValue)>,
}

impl WireCommit {
    /// Hashes of all values offloaded to the object store.
    pub fn referenced_objects(&self) -> Vec<ObjectHash> {
        self.values
            .iter()
            .filter_map(|(_, value)| match value {
                WireValue::Object(hash) => Some(*hash),
                WireValue::Inline(_) => None,
            })
            .collect()
    }

    /// Materialize the tree, resolving object references through `lookup`.
    ///
    /// Returns the first unresolvable hash as the error.
    pub fn resolve_tree<F>(&self, lookup: F) -> Result<Tree, ObjectHash>
    where
        F: Fn(&ObjectHash) -> Option<Bytes>,
    {
        let mut tree = Tree::new();
        for (key, value) in &self.values {
            let bytes = match value {
                WireValue::Inline(bytes) => bytes.clone(),
                WireValue::Object(hash) => lookup(hash).ok_or(*hash)?,
            };
            tree.insert(key.clone(), bytes);
        }
        Ok(tree)
    }
}

/// Encoder output: the wire bytes plus any offloaded value objects the
/// uploader must push before the commit record itself.
pub struct EncodedCommit {
    pub bytes: Bytes,
    pub objects: Vec<(ObjectHash, Bytes)>,
}

/// Encode a commit's identity fields and tree into the wire format.
pub fn encode_commit(
    parents: &[CommitId],
    generation: u64,
    timestamp_ms: u64,
    tree: &Tree,
    inline_limit: usize,
) -> Result<EncodedCommit, CoreError> {
    let mut buf = Vec::new();
    let mut objects = Vec::new();
    let mut enc = minicbor::Encoder::new(&mut buf);

    enc.array(5)
        .and_then(|e| e.u32(WIRE_VERSION))
        .map_err(encode_err)?;
    enc.array(parents.len() as u64).map_err(encode_err)?;
    for parent in parents {
        enc.bytes(parent.as_bytes()).map_err(encode_err)?;
    }
    enc.u64(generation)
        .and_then(|e| e.u64(timestamp_ms))
        .map_err(encode_err)?;
    enc.array(tree.len() as u64).map_err(encode_err)?;
    for (key, value) in tree.iter() {
        enc.array(3).and_then(|e| e.str(key)).map_err(encode_err)?;
        if value.len() <= inline_limit {
            enc.u8(KIND_INLINE)
                .and_then(|e| e.bytes(value))
                .map_err(encode_err)?;
        } else {
            let hash = object_hash(value);
            objects.push((hash, value.clone()));
            enc.u8(KIND_OBJECT)
                .and_then(|e| e.bytes(hash.as_bytes()))
                .map_err(encode_err)?;
        }
    }

    Ok(EncodedCommit {
        bytes: Bytes::from(buf),
        objects,
    })
}

/// Decode a remote commit record.
pub fn decode_commit(bytes: &[u8]) -> Result<WireCommit, CoreError> {
    let mut dec = minicbor::Decoder::new(bytes);

    let top = dec.array().map_err(decode_err)?;
    if top != Some(5) {
        return Err(CoreError::Decode(format!(
            "expected 5-element record, got {top:?}"
        )));
    }
    let version = dec.u32().map_err(decode_err)?;
    if version != WIRE_VERSION {
        return Err(CoreError::Decode(format!(
            "unsupported wire version {version}"
        )));
    }

    let parent_count = dec
        .array()
        .map_err(decode_err)?
        .ok_or_else(|| CoreError::Decode("indefinite parent list".into()))?;
    let mut parents = Vec::with_capacity(parent_count as usize);
    for _ in 0..parent_count {
        let raw = dec.bytes().map_err(decode_err)?;
        parents.push(CommitId::from_slice(raw)?);
    }

    let generation = dec.u64().map_err(decode_err)?;
    let timestamp_ms = dec.u64().map_err(decode_err)?;

    let entry_count = dec
        .array()
        .map_err(decode_err)?
        .ok_or_else(|| CoreError::Decode("indefinite entry list".into()))?;
    let mut values = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let triple = dec.array().map_err(decode_err)?;
        if triple != Some(3) {
            return Err(CoreError::Decode(format!(
                "expected 3-element entry, got {triple:?}"
            )));
        }
        let key = dec.str().map_err(decode_err)?.to_string();
        let kind = dec.u8().map_err(decode_err)?;
        let payload = dec.bytes().map_err(decode_err)?;
        let value = match kind {
            KIND_INLINE => WireValue::Inline(Bytes::copy_from_slice(payload)),
            KIND_OBJECT => WireValue::Object(ObjectHash::from_slice(payload)?),
            other => {
                return Err(CoreError::Decode(format!("unknown value kind {other}")));
            }
        };
        values.push((key, value));
    }

    Ok(WireCommit {
        parents,
        generation,
        timestamp_ms,
        values,
    })
}

fn encode_err<E: std::fmt::Display>(err: minicbor::encode::Error<E>) -> CoreError {
    CoreError::Encode(err.to_string())
}

fn decode_err(err: minicbor::decode::Error) -> CoreError {
    CoreError::Decode(err.to_string())
}
