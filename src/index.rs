//! The `ContentsIndex` trait: the read/write surface every layer serves
//!
//! Mutable generations, committing wrappers, serialized segments, pending
//! merge outputs and the layered index itself all implement this trait, so
//! the layered machinery can hold them uniformly as `Arc<dyn ContentsIndex>`.

use std::sync::Arc;

use crate::contents::Contents;
use crate::error::Result;
use crate::storage::SerializedSegment;
use crate::types::{BlockInfo, Entity, EntityId, PostingRef};

/// What stage of its lifecycle a layer is in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    /// Accepting writes
    Mutable,
    /// Frozen, a background commit in flight
    Committing,
    /// Pending output of a running merge
    Merging,
    /// Fully serialized, reads served from the committed artifact
    Serialized,
}

/// Streaming cursor over the postings of one key.
///
/// `find` seeks forward to the first posting with index `>= entity`;
/// repeated calls with increasing targets walk the block in order.
pub trait EntityCursor: Send {
    fn find(&mut self, entity: u32) -> Option<PostingRef<'_>>;

    fn block_type(&self) -> u32;

    /// Live posting count at the time the cursor was opened
    fn size(&self) -> u32;
}

/// An index layer: entity table plus per-key posting blocks.
///
/// All methods take `&self`; implementations synchronize internally. Write
/// methods on read-only layers report errors rather than panic.
pub trait ContentsIndex: Send + Sync {
    fn get_entity(&self, id: &EntityId) -> Option<Entity>;

    fn get_entity_by_index(&self, index: u32) -> Option<Entity>;

    /// Record the entity and index its contents. An entity with the same
    /// id is displaced. `Err(Overflow)` means the layer's budget is spent
    /// and no observable mutation happened.
    fn set_entity(
        &self,
        id: EntityId,
        contents: Option<&dyn Contents>,
        extras: &[u8],
    ) -> Result<Entity>;

    /// Tombstone the entity. Returns whether it existed.
    fn del_entity(&self, id: &EntityId) -> Result<bool>;

    /// Replace the opaque extras blob without reindexing contents
    fn set_extras(&self, id: &EntityId, extras: &[u8]) -> Result<bool>;

    /// Highest entity index ever allocated in this layer (0 when empty)
    fn get_max_index(&self) -> u32;

    /// Open a cursor over one key's postings. Cursors are self-contained
    /// and keep the data they traverse alive.
    fn get_key_block(&self, key: &[u8]) -> Option<Box<dyn EntityCursor>>;

    fn get_key_stats(&self, key: &[u8]) -> BlockInfo;

    /// All keys matching a glob pattern, in sorted order
    fn key_set(&self, pattern: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Live entities ordered by id. Layers that cannot enumerate (the
    /// layered composite) return `NotImplemented`.
    fn list_entities(&self) -> Result<Vec<Entity>>;

    /// Serialize this layer's live data and return the committed artifact
    fn commit(&self) -> Result<Arc<SerializedSegment>>;

    /// Collapse this layer to its cheapest read-only form. Identity for
    /// layers that are already as reduced as they get.
    fn reduce(self: Arc<Self>) -> Result<Arc<dyn ContentsIndex>>;

    fn kind(&self) -> LayerKind;
}
