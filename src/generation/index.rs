//! The mutable generation: a bounded writable index layer
//!
//! A generation accepts writes until its entity or byte budget is spent,
//! then reports `Overflow` without mutating anything, which is the signal
//! for the layered index to rotate it out and retry elsewhere.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::chains::{BlockChains, ChainLink};
use crate::config::Settings;
use crate::contents::{Contents, IndexSink};
use crate::error::{Result, StrataError};
use crate::generation::{Bitmap, EntityTable};
use crate::index::{ContentsIndex, EntityCursor, LayerKind};
use crate::storage::{SerializedSegment, Storage, Stream};
use crate::types::{BlockInfo, Entity, EntityId, PostingRef, TOMBSTONE};

pub struct MutableIndex {
    settings: Settings,
    chains: Arc<BlockChains>,
    entities: Mutex<EntityTable>,
    /// Entity slots displaced or deleted after being written
    shadowed: Arc<Bitmap>,
    /// Bytes charged by chain and entity allocations
    meter: Arc<AtomicUsize>,
    /// Version counter, shared across generations of one layered index
    versions: Arc<AtomicU64>,
    storage: Arc<dyn Storage>,
}

impl MutableIndex {
    pub fn new(settings: Settings, storage: Arc<dyn Storage>, versions: Arc<AtomicU64>) -> Self {
        let meter = Arc::new(AtomicUsize::new(0));
        Self {
            chains: Arc::new(BlockChains::new(Arc::clone(&meter))),
            entities: Mutex::new(EntityTable::new()),
            shadowed: Arc::new(Bitmap::new(settings.max_entities as usize + 1)),
            meter,
            versions,
            settings,
            storage,
        }
    }

    /// Bytes currently charged against the generation budget
    pub fn allocated_bytes(&self) -> usize {
        self.meter.load(Ordering::Relaxed)
    }

    /// Whole-index order check, for tests
    pub fn verify(&self) -> bool {
        self.chains.verify()
    }
}

/// Feeds one entity's enumerated keys into the chain table
struct ChainSink<'a> {
    chains: &'a BlockChains,
    entity: u32,
}

impl IndexSink for ChainSink<'_> {
    fn insert(&mut self, key: &[u8], payload: &[u8], block_type: u32) -> Result<()> {
        self.chains.insert(key, self.entity, payload, block_type)
    }
}

impl ContentsIndex for MutableIndex {
    fn get_entity(&self, id: &EntityId) -> Option<Entity> {
        self.entities.lock().get(id)
    }

    fn get_entity_by_index(&self, index: u32) -> Option<Entity> {
        self.entities.lock().get_by_index(index)
    }

    fn set_entity(
        &self,
        id: EntityId,
        contents: Option<&dyn Contents>,
        extras: &[u8],
    ) -> Result<Entity> {
        // Both budgets are checked before anything is touched, so an
        // overflowing call has no observable effect
        if self.meter.load(Ordering::Relaxed) > self.settings.max_allocate {
            return Err(StrataError::Overflow("memory budget spent"));
        }

        let entity = {
            let mut table = self.entities.lock();
            if table.max_index() >= self.settings.max_entities {
                return Err(StrataError::Overflow("entity budget spent"));
            }
            let version = self.versions.fetch_add(1, Ordering::AcqRel) + 1;
            let (entity, displaced) = table.set_entity(id, version, extras);
            if let Some(old) = displaced {
                self.shadowed.set(old);
            }
            entity
        };

        self.meter.fetch_add(
            std::mem::size_of::<Entity>() + entity.id.len() + extras.len(),
            Ordering::Relaxed,
        );

        if let Some(contents) = contents {
            let mut sink = ChainSink {
                chains: &self.chains,
                entity: entity.index,
            };
            contents.enumerate(&mut sink)?;
        }

        Ok(entity)
    }

    fn del_entity(&self, id: &EntityId) -> Result<bool> {
        let removed = self.entities.lock().del_entity(id);
        match removed {
            Some(index) => {
                self.shadowed.set(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_extras(&self, id: &EntityId, extras: &[u8]) -> Result<bool> {
        Ok(self.entities.lock().set_extras(id, extras))
    }

    fn get_max_index(&self) -> u32 {
        self.entities.lock().max_index()
    }

    fn get_key_block(&self, key: &[u8]) -> Option<Box<dyn EntityCursor>> {
        let hook = self.chains.lookup(key)?;
        Some(Box::new(ChainCursor {
            cursor: hook.first_ptr(),
            block_type: hook.block_type(),
            size: hook.count(),
            shadowed: Arc::clone(&self.shadowed),
            _chains: Arc::clone(&self.chains),
        }))
    }

    fn get_key_stats(&self, key: &[u8]) -> BlockInfo {
        self.chains.get_key_stats(key)
    }

    fn key_set(&self, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.chains.key_set(pattern))
    }

    fn list_entities(&self) -> Result<Vec<Entity>> {
        Ok(self.entities.lock().list_by_id())
    }

    fn commit(&self) -> Result<Arc<SerializedSegment>> {
        self.chains.stop();
        self.chains.remove(&self.shadowed);

        let table = self.entities.lock();
        debug_assert!(self.chains.verify_ids(table.max_index()));
        info!(
            entities = table.live_count(),
            keys = self.chains.key_count(),
            bytes = self.allocated_bytes(),
            "committing generation"
        );

        let mut store = self.storage.create_store()?;
        store.write(Stream::Entities, &table.serialize()?)?;
        self.chains.serialize(store.as_mut())?;
        store.commit()
    }

    fn reduce(self: Arc<Self>) -> Result<Arc<dyn ContentsIndex>> {
        Ok(self)
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Mutable
    }
}

/// Forward-only cursor over one key's chain, skipping tombstoned and
/// shadowed postings. Holds the chain table alive; links are never freed
/// while it does.
struct ChainCursor {
    cursor: *const ChainLink,
    block_type: u32,
    size: u32,
    shadowed: Arc<Bitmap>,
    _chains: Arc<BlockChains>,
}

unsafe impl Send for ChainCursor {}

impl EntityCursor for ChainCursor {
    fn find(&mut self, entity: u32) -> Option<PostingRef<'_>> {
        while !self.cursor.is_null() {
            let link: &ChainLink = unsafe { &*self.cursor };
            self.cursor = link.next_ptr();

            let found = link.entity();
            if found == TOMBSTONE || found < entity || self.shadowed.get(found) {
                continue;
            }
            return Some(PostingRef {
                entity: found,
                payload: link.payload(),
            });
        }
        None
    }

    fn block_type(&self) -> u32 {
        self.block_type
    }

    fn size(&self) -> u32 {
        self.size
    }
}
