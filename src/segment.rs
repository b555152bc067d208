//! Immutable serialized generations
//!
//! A `SegmentIndex` serves the read API straight from a committed
//! segment's three streams: the bincode entity records, the FST key
//! dictionary with its per-key metadata, and the diff-encoded posting
//! blocks. Deletions after load are runtime-only tombstones; nothing in
//! the artifact is rewritten.

use std::collections::BTreeMap;
use std::sync::Arc;

use fst::Streamer;
use tracing::debug;

use crate::chains::KeyMeta;
use crate::codec::{decode_delta, decode_vbyte};
use crate::error::{Result, StrataError};
use crate::generation::Bitmap;
use crate::index::{ContentsIndex, EntityCursor, LayerKind};
use crate::storage::SerializedSegment;
use crate::strmatch::glob_compare;
use crate::types::{block_type_has_payload, BlockInfo, Entity, EntityId, PostingRef};

pub struct SegmentIndex {
    segment: Arc<SerializedSegment>,
    /// Live records ordered by index, as committed
    records: Vec<Entity>,
    by_id: BTreeMap<EntityId, usize>,
    keys: fst::Map<Vec<u8>>,
    metas: Vec<KeyMeta>,
    /// Runtime deletions since load
    shadowed: Arc<Bitmap>,
}

impl SegmentIndex {
    pub fn load(segment: Arc<SerializedSegment>) -> Result<Self> {
        if !segment.verify_checksum() {
            return Err(StrataError::Storage("segment checksum mismatch".into()));
        }

        let records: Vec<Entity> = if segment.entities.is_empty() {
            Vec::new()
        } else {
            bincode::deserialize(&segment.entities)?
        };
        let by_id = records
            .iter()
            .enumerate()
            .map(|(slot, e)| (e.id.clone(), slot))
            .collect();

        let contents = &segment.contents;
        if contents.len() < 8 {
            return Err(StrataError::Storage("truncated key dictionary".into()));
        }
        let fst_len = u64::from_le_bytes(
            contents[..8]
                .try_into()
                .map_err(|_| StrataError::Storage("truncated key dictionary".into()))?,
        ) as usize;
        if contents.len() < 8 + fst_len {
            return Err(StrataError::Storage("truncated key dictionary".into()));
        }
        let keys = fst::Map::new(contents[8..8 + fst_len].to_vec())?;
        let metas: Vec<KeyMeta> = bincode::deserialize(&contents[8 + fst_len..])?;

        let max_index = records.last().map(|e| e.index).unwrap_or(0);
        debug!(
            entities = records.len(),
            keys = metas.len(),
            bytes = segment.total_bytes(),
            "segment loaded"
        );

        Ok(Self {
            shadowed: Arc::new(Bitmap::new(max_index as usize + 1)),
            segment,
            records,
            by_id,
            keys,
            metas,
        })
    }

    pub fn segment(&self) -> &Arc<SerializedSegment> {
        &self.segment
    }

    fn record_at(&self, slot: usize) -> Option<Entity> {
        let record = self.records.get(slot)?;
        if self.shadowed.get(record.index) {
            None
        } else {
            Some(record.clone())
        }
    }
}

impl ContentsIndex for SegmentIndex {
    fn get_entity(&self, id: &EntityId) -> Option<Entity> {
        self.record_at(*self.by_id.get(id)?)
    }

    fn get_entity_by_index(&self, index: u32) -> Option<Entity> {
        // Records are sorted by index but sparse after purges
        let slot = self
            .records
            .binary_search_by_key(&index, |e| e.index)
            .ok()?;
        self.record_at(slot)
    }

    fn set_entity(
        &self,
        _id: EntityId,
        _contents: Option<&dyn crate::contents::Contents>,
        _extras: &[u8],
    ) -> Result<Entity> {
        Err(StrataError::InvalidState("serialized layer is read-only"))
    }

    fn del_entity(&self, id: &EntityId) -> Result<bool> {
        match self.by_id.get(id).map(|&slot| &self.records[slot]) {
            Some(record) if !self.shadowed.get(record.index) => {
                self.shadowed.set(record.index);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_extras(&self, _id: &EntityId, _extras: &[u8]) -> Result<bool> {
        Err(StrataError::InvalidState("serialized layer is read-only"))
    }

    fn get_max_index(&self) -> u32 {
        self.records.last().map(|e| e.index).unwrap_or(0)
    }

    fn get_key_block(&self, key: &[u8]) -> Option<Box<dyn EntityCursor>> {
        let ordinal = self.keys.get(key)? as usize;
        let meta = self.metas.get(ordinal)?;
        let start = meta.offset as usize;
        let end = start + meta.length as usize;
        Some(Box::new(SegmentCursor {
            chains: Arc::clone(&self.segment.chains),
            shadowed: Arc::clone(&self.shadowed),
            pos: start,
            end,
            prev: 0,
            block_type: meta.block_type,
            size: meta.count,
        }))
    }

    fn get_key_stats(&self, key: &[u8]) -> BlockInfo {
        match self.keys.get(key) {
            Some(ordinal) => {
                let meta = &self.metas[ordinal as usize];
                BlockInfo {
                    block_type: meta.block_type,
                    count: meta.count,
                }
            }
            None => BlockInfo::ABSENT,
        }
    }

    fn key_set(&self, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        let mut stream = self.keys.stream();
        while let Some((key, _)) = stream.next() {
            match glob_compare(pattern, key) {
                std::cmp::Ordering::Equal => out.push(key.to_vec()),
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(out)
    }

    fn list_entities(&self) -> Result<Vec<Entity>> {
        Ok(self
            .by_id
            .values()
            .filter_map(|&slot| self.record_at(slot))
            .collect())
    }

    fn commit(&self) -> Result<Arc<SerializedSegment>> {
        Ok(Arc::clone(&self.segment))
    }

    fn reduce(self: Arc<Self>) -> Result<Arc<dyn ContentsIndex>> {
        Ok(self)
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Serialized
    }
}

/// Decoding cursor over one serialized posting block
struct SegmentCursor {
    chains: Arc<[u8]>,
    shadowed: Arc<Bitmap>,
    pos: usize,
    end: usize,
    prev: u32,
    block_type: u32,
    size: u32,
}

impl EntityCursor for SegmentCursor {
    fn find(&mut self, entity: u32) -> Option<PostingRef<'_>> {
        let typed = block_type_has_payload(self.block_type);

        while self.pos < self.end {
            let delta = decode_vbyte(&self.chains[..self.end], &mut self.pos).ok()?;
            let found = decode_delta(delta, self.prev);
            self.prev = found;

            let (payload_start, payload_end) = if typed {
                let len = decode_vbyte(&self.chains[..self.end], &mut self.pos).ok()? as usize;
                let start = self.pos;
                if start + len > self.end {
                    return None;
                }
                self.pos += len;
                (start, start + len)
            } else {
                (self.pos, self.pos)
            };

            if found < entity || self.shadowed.get(found) {
                continue;
            }
            return Some(PostingRef {
                entity: found,
                payload: &self.chains[payload_start..payload_end],
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::contents::PairsContents;
    use crate::generation::MutableIndex;
    use crate::storage::{MemoryStorage, Storage};
    use std::sync::atomic::AtomicU64;

    fn committed_segment() -> Arc<SerializedSegment> {
        let storage = Arc::new(MemoryStorage::new());
        let index = MutableIndex::new(
            Settings::default(),
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::new(AtomicU64::new(0)),
        );

        for (id, keys) in [
            ("doc-a", vec!["alpha", "beta"]),
            ("doc-b", vec!["beta", "gamma"]),
            ("doc-c", vec!["beta"]),
        ] {
            let mut contents = PairsContents::new();
            for key in keys {
                contents = contents.with_key(key);
            }
            index
                .set_entity(EntityId::from(id), Some(&contents), b"x")
                .unwrap();
        }
        index.commit().unwrap()
    }

    fn gather(cursor: &mut dyn EntityCursor) -> Vec<u32> {
        let mut out = Vec::new();
        let mut next = 0;
        while let Some(posting) = cursor.find(next) {
            out.push(posting.entity);
            next = posting.entity + 1;
        }
        out
    }

    #[test]
    fn test_roundtrip_reads() {
        let segment = SegmentIndex::load(committed_segment()).unwrap();

        assert_eq!(segment.get_max_index(), 3);
        let doc_b = segment.get_entity(&EntityId::from("doc-b")).unwrap();
        assert_eq!(doc_b.index, 2);
        assert_eq!(doc_b.extras, b"x");
        assert_eq!(segment.get_entity_by_index(2).unwrap().id, doc_b.id);

        let mut cursor = segment.get_key_block(b"beta").unwrap();
        assert_eq!(gather(cursor.as_mut()), vec![1, 2, 3]);
        assert!(segment.get_key_block(b"missing").is_none());

        let stats = segment.get_key_stats(b"beta");
        assert_eq!(stats.count, 3);
        assert_eq!(stats.block_type, 0);
    }

    #[test]
    fn test_key_set_glob() {
        let segment = SegmentIndex::load(committed_segment()).unwrap();
        assert_eq!(
            segment.key_set(b"*a*").unwrap(),
            vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]
        );
        assert_eq!(segment.key_set(b"g*").unwrap(), vec![b"gamma".to_vec()]);
    }

    #[test]
    fn test_runtime_delete() {
        let segment = SegmentIndex::load(committed_segment()).unwrap();
        assert!(segment.del_entity(&EntityId::from("doc-b")).unwrap());
        assert!(!segment.del_entity(&EntityId::from("doc-b")).unwrap());

        assert!(segment.get_entity(&EntityId::from("doc-b")).is_none());
        assert!(segment.get_entity_by_index(2).is_none());

        let mut cursor = segment.get_key_block(b"beta").unwrap();
        assert_eq!(gather(cursor.as_mut()), vec![1, 3]);
        assert_eq!(segment.list_entities().unwrap().len(), 2);
    }

    #[test]
    fn test_writes_rejected() {
        let segment = SegmentIndex::load(committed_segment()).unwrap();
        assert!(segment
            .set_entity(EntityId::from("new"), None, b"")
            .is_err());
        assert!(segment.set_extras(&EntityId::from("doc-a"), b"").is_err());
    }

    #[test]
    fn test_corrupted_segment_rejected() {
        let good = committed_segment();
        let bad = Arc::new(SerializedSegment {
            entities: good.entities.clone(),
            contents: good.contents.clone(),
            chains: Arc::from(&b"garbage"[..]),
            checksum: good.checksum,
        });
        assert!(SegmentIndex::load(bad).is_err());
    }

    #[test]
    fn test_payload_roundtrip() {
        let storage = Arc::new(MemoryStorage::new());
        let index = MutableIndex::new(
            Settings::default(),
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::new(AtomicU64::new(0)),
        );
        let contents = PairsContents::new().with_pair("word", "pos:2,7");
        index
            .set_entity(EntityId::from("doc"), Some(&contents), b"")
            .unwrap();

        let segment = SegmentIndex::load(index.commit().unwrap()).unwrap();
        let mut cursor = segment.get_key_block(b"word").unwrap();
        assert_eq!(cursor.block_type(), 0x10);
        let posting = cursor.find(0).unwrap();
        assert_eq!(posting.entity, 1);
        assert_eq!(posting.payload, b"pos:2,7");
    }
}
