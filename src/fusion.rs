//! K-way fusion of index layers into one serialized segment
//!
//! The merge walks every source's entities in id order, keeps the highest
//! version of each id, renumbers survivors densely and rewrites every
//! posting block with the surviving indices. While a spawned merge runs,
//! the pending [`FusionIndex`] keeps serving reads from its sources.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::chains::KeyMeta;
use crate::codec::{encode_delta, encode_vbyte};
use crate::error::{Result, StrataError};
use crate::index::{ContentsIndex, EntityCursor, LayerKind};
use crate::layered::{token_of, IndexLayers};
use crate::notify::{ignore_notify, Event, NotifyFn};
use crate::segment::SegmentIndex;
use crate::storage::{IndexStore, SerializedSegment, Stream};
use crate::types::{BlockInfo, Entity, EntityId, TOMBSTONE};

/// Cancellation probe checked between keys
pub type CanContinue = Arc<dyn Fn() -> bool + Send + Sync>;

/// How a merge run ended
pub enum MergeOutcome {
    Done(Arc<SerializedSegment>),
    /// No entity survived the merge
    Empty,
    /// The cancellation probe stopped the run
    Canceled,
}

/// Builder for one merge job
pub struct Merger {
    sources: Vec<Arc<dyn ContentsIndex>>,
    store: Option<Box<dyn IndexStore>>,
    notify: NotifyFn,
    can_continue: CanContinue,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}

impl Merger {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            store: None,
            notify: ignore_notify(),
            can_continue: Arc::new(|| true),
        }
    }

    /// Add a source layer; later sources win version ties
    pub fn add(mut self, source: Arc<dyn ContentsIndex>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn set_storage(mut self, store: Box<dyn IndexStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn set_notify(mut self, notify: NotifyFn) -> Self {
        self.notify = notify;
        self
    }

    pub fn set_can_continue(mut self, probe: CanContinue) -> Self {
        self.can_continue = probe;
        self
    }

    /// Run the merge on the calling thread
    pub fn run(self) -> Result<MergeOutcome> {
        let store = self
            .store
            .ok_or(StrataError::InvalidState("merge store not set"))?;
        execute(&self.sources, store, &self.can_continue)
    }

    /// Run the merge on a background thread, reporting the outcome through
    /// the notify callback. The returned pending index serves reads from
    /// the sources until the monitor swaps it for the reduced result.
    pub fn spawn(self) -> Result<Arc<FusionIndex>> {
        let Merger {
            sources,
            store,
            notify,
            can_continue,
        } = self;
        let store = store.ok_or(StrataError::InvalidState("merge store not set"))?;

        let mut delegate = IndexLayers::new();
        for source in &sources {
            delegate.add_contents(Arc::clone(source));
        }

        let this = Arc::new(FusionIndex {
            delegate,
            result: Mutex::new(None),
            worker: Mutex::new(None),
        });
        let token = token_of(&(Arc::clone(&this) as Arc<dyn ContentsIndex>));
        let weak = Arc::downgrade(&this);

        let handle = std::thread::Builder::new()
            .name("fusion".into())
            .spawn(move || match execute(&sources, store, &can_continue) {
                Ok(MergeOutcome::Done(segment)) => {
                    if let Some(this) = weak.upgrade() {
                        *this.result.lock() = Some(Arc::clone(&segment));
                    }
                    info!(bytes = segment.total_bytes(), "merge finished");
                    notify(token, Event::Ok);
                }
                Ok(MergeOutcome::Empty) => notify(token, Event::Empty),
                Ok(MergeOutcome::Canceled) => notify(token, Event::Canceled),
                Err(e) => {
                    error!(error = %e, "merge failed");
                    notify(token, Event::Failed);
                }
            })?;

        *this.worker.lock() = Some(handle);
        Ok(this)
    }
}

/// Merge the entity tables: id-ordered k-way walk, highest version wins,
/// survivors renumbered densely from 1. `remap[source][local]` holds the
/// new index of a surviving posting, `TOMBSTONE` otherwise.
fn merge_entities(sources: &[Arc<dyn ContentsIndex>]) -> Result<(Vec<Entity>, Vec<Vec<u32>>)> {
    let mut remap: Vec<Vec<u32>> = sources
        .iter()
        .map(|s| vec![TOMBSTONE; s.get_max_index() as usize + 1])
        .collect();
    let lists: Vec<Vec<Entity>> = sources
        .iter()
        .map(|s| s.list_entities())
        .collect::<Result<_>>()?;

    let mut pos = vec![0usize; lists.len()];
    let mut merged = Vec::new();
    let mut next_index = 1u32;

    loop {
        let mut min_id: Option<EntityId> = None;
        for (i, list) in lists.iter().enumerate() {
            if let Some(head) = list.get(pos[i]) {
                if min_id.as_ref().map_or(true, |m| head.id < *m) {
                    min_id = Some(head.id.clone());
                }
            }
        }
        let Some(min_id) = min_id else { break };

        // Later sources win ties, so `>=` keeps the newest copy
        let mut winner = 0usize;
        let mut best: Option<&Entity> = None;
        for (i, list) in lists.iter().enumerate() {
            if let Some(head) = list.get(pos[i]) {
                if head.id == min_id && best.map_or(true, |b| head.version >= b.version) {
                    winner = i;
                    best = Some(head);
                }
            }
        }
        let best = best.ok_or(StrataError::InvalidState("merge lost its minimum id"))?;
        merged.push(Entity {
            id: best.id.clone(),
            index: next_index,
            version: best.version,
            extras: best.extras.clone(),
            bundle_offset: best.bundle_offset,
        });

        for (i, list) in lists.iter().enumerate() {
            if let Some(head) = list.get(pos[i]) {
                if head.id == min_id {
                    if i == winner {
                        remap[i][head.index as usize] = next_index;
                    }
                    pos[i] += 1;
                }
            }
        }
        next_index += 1;
    }

    Ok((merged, remap))
}

/// Collect one key's surviving postings across all sources, remapped and
/// sorted by their new indices
fn gather_key(
    sources: &[Arc<dyn ContentsIndex>],
    remap: &[Vec<u32>],
    key: &[u8],
) -> Result<(u32, Vec<(u32, Vec<u8>)>)> {
    let mut block_type = u32::MAX;
    let mut postings = Vec::new();

    for (i, source) in sources.iter().enumerate() {
        let Some(mut cursor) = source.get_key_block(key) else {
            continue;
        };
        if block_type == u32::MAX {
            block_type = cursor.block_type();
        } else if block_type != cursor.block_type() {
            return Err(StrataError::BlockTypeMismatch {
                expected: block_type,
                given: cursor.block_type(),
            });
        }

        let mut next = 0;
        while let Some(posting) = cursor.find(next) {
            next = posting.entity + 1;
            let mapped = remap[i]
                .get(posting.entity as usize)
                .copied()
                .unwrap_or(TOMBSTONE);
            if mapped != TOMBSTONE {
                postings.push((mapped, posting.payload.to_vec()));
            }
        }
    }

    postings.sort_by_key(|&(entity, _)| entity);
    Ok((block_type, postings))
}

fn execute(
    sources: &[Arc<dyn ContentsIndex>],
    mut store: Box<dyn IndexStore>,
    can_continue: &CanContinue,
) -> Result<MergeOutcome> {
    let (records, remap) = merge_entities(sources)?;
    if records.is_empty() {
        store.remove()?;
        return Ok(MergeOutcome::Empty);
    }

    let mut keys = BTreeSet::new();
    for source in sources {
        keys.extend(source.key_set(b"*")?);
    }

    let mut metas = Vec::with_capacity(keys.len());
    let mut written_keys = Vec::with_capacity(keys.len());
    let mut block = Vec::new();

    for key in keys {
        if !can_continue() {
            store.remove()?;
            return Ok(MergeOutcome::Canceled);
        }

        let (block_type, postings) = gather_key(sources, &remap, &key)?;
        if postings.is_empty() {
            continue;
        }

        block.clear();
        let typed = crate::types::block_type_has_payload(block_type);
        let mut prev = 0u32;
        let mut count = 0u32;
        for (entity, payload) in &postings {
            encode_vbyte(encode_delta(*entity, prev), &mut block);
            if typed {
                encode_vbyte(payload.len() as u32, &mut block);
                block.extend_from_slice(payload);
            }
            prev = *entity;
            count += 1;
        }

        let offset = store.position(Stream::Chains);
        store.write(Stream::Chains, &block)?;
        metas.push(KeyMeta {
            block_type,
            count,
            offset,
            length: block.len() as u32,
        });
        written_keys.push(key);
    }

    store.write(Stream::Entities, &bincode::serialize(&records)?)?;

    let mut builder = fst::MapBuilder::memory();
    for (ordinal, key) in written_keys.iter().enumerate() {
        builder.insert(key, ordinal as u64)?;
    }
    let fst_bytes = builder.into_inner()?;
    store.write(Stream::Contents, &(fst_bytes.len() as u64).to_le_bytes())?;
    store.write(Stream::Contents, &fst_bytes)?;
    store.write(Stream::Contents, &bincode::serialize(&metas)?)?;

    info!(
        entities = records.len(),
        keys = metas.len(),
        sources = sources.len(),
        "merged layers"
    );
    Ok(MergeOutcome::Done(store.commit()?))
}

/// Pending output of a running merge: reads delegate to the sources until
/// the result is available
pub struct FusionIndex {
    delegate: IndexLayers,
    result: Mutex<Option<Arc<SerializedSegment>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ContentsIndex for FusionIndex {
    fn get_entity(&self, id: &EntityId) -> Option<Entity> {
        self.delegate.get_entity(id)
    }

    fn get_entity_by_index(&self, index: u32) -> Option<Entity> {
        self.delegate.get_entity_by_index(index)
    }

    fn set_entity(
        &self,
        _id: EntityId,
        _contents: Option<&dyn crate::contents::Contents>,
        _extras: &[u8],
    ) -> Result<Entity> {
        Err(StrataError::InvalidState("merge output is read-only"))
    }

    fn del_entity(&self, id: &EntityId) -> Result<bool> {
        self.delegate.del_entity(id)
    }

    fn set_extras(&self, _id: &EntityId, _extras: &[u8]) -> Result<bool> {
        Err(StrataError::InvalidState("merge output is read-only"))
    }

    fn get_max_index(&self) -> u32 {
        self.delegate.get_max_index()
    }

    fn get_key_block(&self, key: &[u8]) -> Option<Box<dyn EntityCursor>> {
        self.delegate.get_key_block(key)
    }

    fn get_key_stats(&self, key: &[u8]) -> BlockInfo {
        self.delegate.get_key_stats(key)
    }

    fn key_set(&self, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.delegate.key_set(pattern)
    }

    fn list_entities(&self) -> Result<Vec<Entity>> {
        Err(StrataError::NotImplemented(
            "entity listing on a merging layer",
        ))
    }

    fn commit(&self) -> Result<Arc<SerializedSegment>> {
        match self.result.lock().clone() {
            Some(segment) => Ok(segment),
            None => Err(StrataError::InvalidState("merge still in flight")),
        }
    }

    fn reduce(self: Arc<Self>) -> Result<Arc<dyn ContentsIndex>> {
        let segment = self
            .result
            .lock()
            .clone()
            .ok_or(StrataError::InvalidState("merge result not available"))?;
        Ok(Arc::new(SegmentIndex::load(segment)?))
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Merging
    }
}

impl Drop for FusionIndex {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
