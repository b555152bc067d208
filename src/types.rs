//! Core types shared across the index engine

use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Sentinel entity index marking a tombstoned posting or remap slot
pub const TOMBSTONE: u32 = u32::MAX;

/// Pseudo block type asking the index to pick a concrete type at the
/// first insert for a key: `0x10` when the posting carries a payload,
/// `0` otherwise.
pub const BLOCK_TYPE_AUTO: u32 = u32::MAX;

/// Block type assigned to payload-carrying keys when the caller passed
/// [`BLOCK_TYPE_AUTO`]
pub const BLOCK_TYPE_CHAINS: u32 = 0x10;

/// Block type for plain entity-list keys (no per-posting payload)
pub const BLOCK_TYPE_SIMPLE: u32 = 0;

/// Opaque immutable entity identifier.
///
/// An `EntityId` is an arbitrary byte string owned behind an `Arc`, so
/// clones are cheap and the id survives the call that created it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(Arc<[u8]>);

impl EntityId {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s.as_bytes()))
    }
}

impl From<&[u8]> for EntityId {
    fn from(b: &[u8]) -> Self {
        Self(Arc::from(b))
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(Arc::from(s.into_bytes().into_boxed_slice()))
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct EntityIdVisitor;

impl<'de> Visitor<'de> for EntityIdVisitor {
    type Value = EntityId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("entity id bytes")
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<EntityId, E> {
        Ok(EntityId::from(v))
    }

    fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> std::result::Result<EntityId, E> {
        Ok(EntityId::new(v.into_boxed_slice()))
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(
        self,
        mut seq: A,
    ) -> std::result::Result<EntityId, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(b) = seq.next_element::<u8>()? {
            out.push(b);
        }
        Ok(EntityId::new(out.into_boxed_slice()))
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(EntityIdVisitor)
    }
}

/// One entity record within a generation.
///
/// `index` is the dense, generation-local slot number starting at 1; 0 is
/// reserved as "no entity". Re-setting an existing id allocates a fresh
/// index and tombstones the old slot, so indices are never reused within
/// one generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub index: u32,
    pub version: u64,
    pub extras: Vec<u8>,
    pub bundle_offset: i64,
}

impl Entity {
    pub fn new(id: EntityId, index: u32, version: u64, extras: Vec<u8>) -> Self {
        Self {
            id,
            index,
            version,
            extras,
            bundle_offset: -1,
        }
    }
}

/// Per-key block statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_type: u32,
    pub count: u32,
}

impl BlockInfo {
    /// The value reported for a key the index has never seen
    pub const ABSENT: BlockInfo = BlockInfo {
        block_type: u32::MAX,
        count: 0,
    };

    pub fn is_absent(&self) -> bool {
        self.block_type == u32::MAX && self.count == 0
    }
}

/// One posting as seen through a cursor: the entity index plus the opaque
/// payload recorded at indexing time (empty for simple blocks).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostingRef<'a> {
    pub entity: u32,
    pub payload: &'a [u8],
}

/// Resolve [`BLOCK_TYPE_AUTO`] against the payload of the first insert
pub fn resolve_block_type(block_type: u32, payload: &[u8]) -> u32 {
    if block_type == BLOCK_TYPE_AUTO {
        if payload.is_empty() {
            BLOCK_TYPE_SIMPLE
        } else {
            BLOCK_TYPE_CHAINS
        }
    } else {
        block_type
    }
}

/// Whether postings of this block type carry a per-posting payload
pub fn block_type_has_payload(block_type: u32) -> bool {
    block_type != BLOCK_TYPE_SIMPLE
}
