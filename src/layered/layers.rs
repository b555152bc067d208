//! The layer sequence: ordered index entries with global index ranges
//!
//! Every entry owns one layer and the contiguous range of global entity
//! indices it is responsible for. The merge monitor may reorder closed
//! entries, so a re-written entity overrides its older copies by entity
//! version, not by position in the sequence.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, warn};

use crate::error::Result;
use crate::index::{ContentsIndex, EntityCursor, LayerKind};
use crate::notify::LayerToken;
use crate::types::{BlockInfo, Entity, EntityId, PostingRef};

/// Identity token of a layer, stable across renumbering
pub fn token_of(index: &Arc<dyn ContentsIndex>) -> LayerToken {
    Arc::as_ptr(index) as *const () as usize
}

#[derive(Clone)]
pub struct LayerEntry {
    /// First global index this layer serves
    pub lower: u32,
    /// Last global index, `u32::MAX` for the open tail
    pub upper: u32,
    pub index: Arc<dyn ContentsIndex>,
    /// Entries replaced by a pending merge, kept for rollback
    pub backup: Vec<LayerEntry>,
}

impl LayerEntry {
    pub fn new(lower: u32, index: Arc<dyn ContentsIndex>) -> Self {
        Self {
            lower,
            upper: u32::MAX,
            index,
            backup: Vec::new(),
        }
    }

    pub fn token(&self) -> LayerToken {
        token_of(&self.index)
    }

    /// Translate a layer-local entity record to global numbering
    pub fn to_global(&self, mut entity: Entity) -> Entity {
        entity.index += self.lower - 1;
        entity
    }

    fn contains(&self, global: u32) -> bool {
        global >= self.lower && global <= self.upper
    }

    fn to_local(&self, global: u32) -> u32 {
        global - self.lower + 1
    }
}

/// The plain layer list with read-side delegation. Callers synchronize
/// around it; the layered index holds it under an `RwLock`.
#[derive(Default)]
pub struct IndexLayers {
    layers: Vec<LayerEntry>,
}

impl IndexLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LayerEntry] {
        &self.layers
    }

    pub fn entries_mut(&mut self) -> &mut Vec<LayerEntry> {
        &mut self.layers
    }

    pub fn tail(&self) -> Option<&LayerEntry> {
        self.layers.last()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Append a layer after the current ones. The previous tail's range is
    /// closed at its real maximum; the new layer becomes the open tail.
    pub fn add_contents(&mut self, index: Arc<dyn ContentsIndex>) {
        let lower = match self.layers.last_mut() {
            Some(last) => {
                last.upper = last.lower + last.index.get_max_index().max(1) - 1;
                last.upper + 1
            }
            None => 1,
        };
        self.layers.push(LayerEntry::new(lower, index));
    }

    pub fn get_entity(&self, id: &EntityId) -> Option<Entity> {
        // Layer position stops tracking age once the monitor re-sorts
        // closed layers by size; the shared version counter decides
        // which copy of an id is current
        let mut newest: Option<Entity> = None;
        for entry in &self.layers {
            if let Some(entity) = entry.index.get_entity(id) {
                if newest.as_ref().map_or(true, |n| entity.version > n.version) {
                    newest = Some(entry.to_global(entity));
                }
            }
        }
        newest
    }

    pub fn get_entity_by_index(&self, global: u32) -> Option<Entity> {
        let entry = self.layers.iter().find(|e| e.contains(global))?;
        entry
            .index
            .get_entity_by_index(entry.to_local(global))
            .map(|e| entry.to_global(e))
    }

    /// Delete the entity from every layer holding a copy
    pub fn del_entity(&self, id: &EntityId) -> Result<bool> {
        let mut deleted = false;
        for entry in &self.layers {
            deleted |= entry.index.del_entity(id)?;
        }
        Ok(deleted)
    }

    pub fn set_extras(&self, id: &EntityId, extras: &[u8]) -> Result<bool> {
        // Only the highest-version copy carries the current record
        let mut newest: Option<(usize, u64)> = None;
        for (slot, entry) in self.layers.iter().enumerate() {
            if let Some(entity) = entry.index.get_entity(id) {
                if newest.map_or(true, |(_, version)| entity.version > version) {
                    newest = Some((slot, entity.version));
                }
            }
        }
        match newest {
            Some((slot, _)) => self.layers[slot].index.set_extras(id, extras),
            None => Ok(false),
        }
    }

    pub fn get_max_index(&self) -> u32 {
        match self.layers.last() {
            Some(last) => {
                let max = last.index.get_max_index();
                if max == 0 {
                    last.lower - 1
                } else {
                    last.lower + max - 1
                }
            }
            None => 0,
        }
    }

    pub fn get_key_block(&self, key: &[u8]) -> Option<Box<dyn EntityCursor>> {
        let mut parts = Vec::new();
        let mut block_type = u32::MAX;
        let mut size = 0u32;

        for entry in &self.layers {
            if let Some(cursor) = entry.index.get_key_block(key) {
                if block_type == u32::MAX {
                    block_type = cursor.block_type();
                }
                size += cursor.size();
                parts.push((entry.lower, cursor));
            }
        }

        if parts.is_empty() {
            return None;
        }
        Some(Box::new(LayeredCursor {
            parts,
            current: 0,
            block_type,
            size,
            scratch: Vec::new(),
        }))
    }

    pub fn get_key_stats(&self, key: &[u8]) -> BlockInfo {
        let mut stats = BlockInfo::ABSENT;
        for entry in &self.layers {
            let layer_stats = entry.index.get_key_stats(key);
            if layer_stats.is_absent() {
                continue;
            }
            if stats.is_absent() {
                stats.block_type = layer_stats.block_type;
                stats.count = 0;
            }
            stats.count += layer_stats.count;
        }
        stats
    }

    pub fn key_set(&self, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut union = BTreeSet::new();
        for entry in &self.layers {
            union.extend(entry.index.key_set(pattern)?);
        }
        Ok(union.into_iter().collect())
    }

    /// Final flush: commit every still-mutable layer. Errors are logged
    /// and do not stop the remaining layers.
    pub fn commit_items(&self) {
        for entry in &self.layers {
            if entry.index.kind() != LayerKind::Mutable {
                continue;
            }
            match entry.index.list_entities() {
                Ok(live) if live.is_empty() => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "cannot inspect layer at shutdown");
                    continue;
                }
            }
            if let Err(e) = entry.index.commit() {
                error!(error = %e, "layer commit failed at shutdown");
            }
        }
    }
}

/// Concatenating cursor over one key's postings across layers, yielding
/// global entity indices in increasing order
struct LayeredCursor {
    parts: Vec<(u32, Box<dyn EntityCursor>)>,
    current: usize,
    block_type: u32,
    size: u32,
    scratch: Vec<u8>,
}

impl EntityCursor for LayeredCursor {
    fn find(&mut self, entity: u32) -> Option<PostingRef<'_>> {
        let mut found = None;
        while self.current < self.parts.len() {
            let (lower, cursor) = &mut self.parts[self.current];
            let local = if entity <= *lower { 1 } else { entity - *lower + 1 };

            if let Some(posting) = cursor.find(local) {
                let global = posting.entity + *lower - 1;
                let payload = posting.payload.to_vec();
                found = Some((global, payload));
                break;
            }
            self.current += 1;
        }

        let (global, payload) = found?;
        self.scratch = payload;
        Some(PostingRef {
            entity: global,
            payload: &self.scratch,
        })
    }

    fn block_type(&self) -> u32 {
        self.block_type
    }

    fn size(&self) -> u32 {
        self.size
    }
}
