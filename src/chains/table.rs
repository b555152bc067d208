//! The key table: hash buckets of posting chains plus the shadow key
//! indexer that keeps a sorted view of every key.
//!
//! Lookups and inserts into existing chains are lock-free. Creating a new
//! key takes a per-bucket spin bit just long enough to link the hook, then
//! hands the hook to a background thread over a bounded queue; the thread
//! maintains the sorted key map that glob scans and serialization walk.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::chains::chain::ChainHook;
use crate::chains::Bitmap;
use crate::codec::{encode_vbyte, vbyte_len};
use crate::error::{Result, StrataError};
use crate::storage::{IndexStore, Stream};
use crate::strmatch::glob_compare;
use crate::types::{block_type_has_payload, resolve_block_type, BlockInfo};

const HASH_TABLE_SIZE: usize = 40013;
const KEY_QUEUE_SIZE: usize = 0x1000;

/// Serialized per-key record in the key dictionary
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeyMeta {
    pub block_type: u32,
    pub count: u32,
    pub offset: u64,
    pub length: u32,
}

/// Raw hook pointer that crosses into the key-indexer thread.
///
/// Safe to send because hooks are only freed by the table's `Drop`, which
/// joins the thread first.
#[derive(Clone, Copy)]
struct HookPtr(*const ChainHook);

unsafe impl Send for HookPtr {}
unsafe impl Sync for HookPtr {}

struct Bucket {
    head: AtomicPtr<ChainHook>,
    /// Spin bit serializing key creation within this bucket
    dirty: AtomicBool,
}

/// State shared with the key-indexer thread
struct KeysShared {
    queue: ArrayQueue<HookPtr>,
    wake: Condvar,
    wait: Mutex<()>,
    running: AtomicBool,
    sorted: RwLock<BTreeMap<Box<[u8]>, HookPtr>>,
}

impl KeysShared {
    fn drain(&self) {
        let mut sorted = self.sorted.write();
        while let Some(hook) = self.queue.pop() {
            let key = unsafe { (*hook.0).key() };
            sorted.insert(key.into(), hook);
        }
    }
}

/// The per-generation key table
pub struct BlockChains {
    buckets: Vec<Bucket>,
    shared: Arc<KeysShared>,
    key_thread: Mutex<Option<JoinHandle<()>>>,
    /// Bytes charged for hooks and links, shared with the owning
    /// generation's budget meter
    meter: Arc<AtomicUsize>,
}

impl BlockChains {
    pub fn new(meter: Arc<AtomicUsize>) -> Self {
        let shared = Arc::new(KeysShared {
            queue: ArrayQueue::new(KEY_QUEUE_SIZE),
            wake: Condvar::new(),
            wait: Mutex::new(()),
            running: AtomicBool::new(true),
            sorted: RwLock::new(BTreeMap::new()),
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("keys-indexer".into())
            .spawn(move || keys_indexer(worker))
            .ok();

        let mut buckets = Vec::with_capacity(HASH_TABLE_SIZE);
        for _ in 0..HASH_TABLE_SIZE {
            buckets.push(Bucket {
                head: AtomicPtr::new(ptr::null_mut()),
                dirty: AtomicBool::new(false),
            });
        }

        Self {
            buckets,
            shared,
            key_thread: Mutex::new(handle),
            meter,
        }
    }

    fn bucket(&self, key: &[u8]) -> &Bucket {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % HASH_TABLE_SIZE]
    }

    fn scan_bucket(head: *const ChainHook, key: &[u8]) -> Option<&'static ChainHook> {
        let mut cursor = head;
        while !cursor.is_null() {
            let hook = unsafe { &*cursor };
            if hook.key() == key {
                return Some(hook);
            }
            cursor = hook.collision_next();
        }
        None
    }

    /// Insert one posting, creating the key's chain on first use
    pub fn insert(&self, key: &[u8], entity: u32, payload: &[u8], block_type: u32) -> Result<()> {
        let block_type = resolve_block_type(block_type, payload);
        let bucket = self.bucket(key);

        // Fast path: the key already exists
        if let Some(hook) = Self::scan_bucket(bucket.head.load(Ordering::Acquire), key) {
            return self.insert_into(hook, entity, payload, block_type);
        }

        // Take the bucket's creation bit and rescan: another thread may
        // have created the key while we raced for the bit
        while bucket
            .dirty
            .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }

        let head = bucket.head.load(Ordering::Acquire);
        if let Some(hook) = Self::scan_bucket(head, key) {
            bucket.dirty.store(false, Ordering::Release);
            return self.insert_into(hook, entity, payload, block_type);
        }

        let hook = Box::into_raw(Box::new(ChainHook::new(key, block_type)));
        unsafe { (*hook).set_collision_next(head) };
        self.meter
            .fetch_add(unsafe { (*hook).footprint() }, Ordering::Relaxed);
        bucket.head.store(hook, Ordering::Release);
        bucket.dirty.store(false, Ordering::Release);

        // Hand the new key to the shadow indexer; spin when the queue is
        // full, waking the consumer each time
        let mut pending = HookPtr(hook);
        while let Err(back) = self.shared.queue.push(pending) {
            pending = back;
            self.shared.wake.notify_one();
            std::thread::yield_now();
        }
        self.shared.wake.notify_one();

        self.insert_into(unsafe { &*hook }, entity, payload, block_type)
    }

    fn insert_into(
        &self,
        hook: &ChainHook,
        entity: u32,
        payload: &[u8],
        block_type: u32,
    ) -> Result<()> {
        if hook.block_type() != block_type {
            return Err(StrataError::BlockTypeMismatch {
                expected: hook.block_type(),
                given: block_type,
            });
        }
        let charged = hook.insert(entity, payload);
        self.meter.fetch_add(charged, Ordering::Relaxed);
        Ok(())
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&ChainHook> {
        let bucket = self.bucket(key);
        Self::scan_bucket(bucket.head.load(Ordering::Acquire), key)
    }

    pub fn get_key_stats(&self, key: &[u8]) -> BlockInfo {
        match self.lookup(key) {
            Some(hook) => BlockInfo {
                block_type: hook.block_type(),
                count: hook.count(),
            },
            None => BlockInfo::ABSENT,
        }
    }

    /// All keys matching a glob pattern, in sorted order
    pub fn key_set(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        let lit_len = pattern
            .iter()
            .position(|&b| b == b'*' || b == b'?')
            .unwrap_or(pattern.len());

        let sorted = self.shared.sorted.read();
        let mut out = Vec::new();
        for key in sorted
            .range::<[u8], _>((
                std::ops::Bound::Included(&pattern[..lit_len]),
                std::ops::Bound::Unbounded,
            ))
            .map(|(k, _)| k)
        {
            match glob_compare(pattern, key) {
                std::cmp::Ordering::Equal => out.push(key.to_vec()),
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Greater => break,
            }
        }
        out
    }

    /// Stop the key-indexer thread and fold in anything still queued.
    /// Idempotent; called before serialization and on drop.
    pub fn stop(&self) {
        let handle = self.key_thread.lock().take();
        if let Some(handle) = handle {
            self.shared.running.store(false, Ordering::Release);
            self.shared.wake.notify_one();
            if handle.join().is_err() {
                debug!("keys-indexer thread panicked");
            }
        }
        // Whatever the thread missed between its last drain and the stop
        // flag is picked up here
        self.shared.drain();
    }

    /// Tombstone every posting of every key whose entity is in `deleted`;
    /// keys left with no live postings are dropped from the sorted view
    pub fn remove(&self, deleted: &Bitmap) {
        let mut sorted = self.shared.sorted.write();
        sorted.retain(|_, hook| unsafe { (*hook.0).remove(deleted).count() > 0 });
    }

    /// Whole-table order check, for tests
    pub fn verify(&self) -> bool {
        for bucket in &self.buckets {
            let mut cursor: *const ChainHook = bucket.head.load(Ordering::Acquire);
            while !cursor.is_null() {
                let hook = unsafe { &*cursor };
                if !hook.verify() {
                    return false;
                }
                cursor = hook.collision_next();
            }
        }
        true
    }

    /// No live posting may reference an entity index above `max_index`
    pub fn verify_ids(&self, max_index: u32) -> bool {
        let sorted = self.shared.sorted.read();
        for hook in sorted.values() {
            let hook = unsafe { &*hook.0 };
            if hook
                .iter()
                .any(|l| !l.is_tombstone() && l.entity() > max_index)
            {
                return false;
            }
        }
        true
    }

    /// Number of keys visible to the sorted view
    pub fn key_count(&self) -> usize {
        self.shared.sorted.read().len()
    }

    /// Serialize every key's live postings to the chains stream and the
    /// key dictionary to the contents stream.
    ///
    /// Call after `stop()`; the sorted view must be complete.
    pub fn serialize(&self, store: &mut dyn IndexStore) -> Result<()> {
        let sorted = self.shared.sorted.read();

        let mut metas = Vec::with_capacity(sorted.len());
        let mut block = Vec::new();

        for (key, hook) in sorted.iter() {
            let hook = unsafe { &*hook.0 };
            let typed = block_type_has_payload(hook.block_type());

            // Expected byte count, computed before encoding; a mismatch
            // after encoding means the chain changed under us
            let mut expected = 0usize;
            let mut prev = 0u32;
            let mut count = 0u32;
            for link in hook.iter().filter(|l| !l.is_tombstone()) {
                let delta = crate::codec::encode_delta(link.entity(), prev);
                expected += vbyte_len(delta);
                if typed {
                    expected += vbyte_len(link.payload().len() as u32) + link.payload().len();
                }
                prev = link.entity();
                count += 1;
            }

            block.clear();
            let mut prev = 0u32;
            for link in hook.iter().filter(|l| !l.is_tombstone()) {
                let delta = crate::codec::encode_delta(link.entity(), prev);
                encode_vbyte(delta, &mut block);
                if typed {
                    encode_vbyte(link.payload().len() as u32, &mut block);
                    block.extend_from_slice(link.payload());
                }
                prev = link.entity();
            }

            if block.len() != expected {
                return Err(StrataError::Serialization(format!(
                    "key {:?}: wrote {} bytes, expected {}",
                    String::from_utf8_lossy(key),
                    block.len(),
                    expected
                )));
            }

            let offset = store.position(Stream::Chains);
            store.write(Stream::Chains, &block)?;
            metas.push(KeyMeta {
                block_type: hook.block_type(),
                count,
                offset,
                length: block.len() as u32,
            });
        }

        // Key dictionary: an FST from key to meta ordinal, then the metas
        let mut builder = fst::MapBuilder::memory();
        for (ordinal, key) in sorted.keys().enumerate() {
            builder.insert(key, ordinal as u64)?;
        }
        let fst_bytes = builder.into_inner()?;

        store.write(Stream::Contents, &(fst_bytes.len() as u64).to_le_bytes())?;
        store.write(Stream::Contents, &fst_bytes)?;
        store.write(Stream::Contents, &bincode::serialize(&metas)?)?;

        Ok(())
    }
}

impl Drop for BlockChains {
    fn drop(&mut self) {
        self.stop();
        for bucket in &self.buckets {
            let mut cursor = bucket.head.load(Ordering::Acquire);
            while !cursor.is_null() {
                let hook = unsafe { Box::from_raw(cursor) };
                cursor = hook.collision_next() as *mut ChainHook;
            }
        }
    }
}

fn keys_indexer(shared: Arc<KeysShared>) {
    debug!("keys-indexer started");
    while shared.running.load(Ordering::Acquire) {
        {
            // Timed wait: a notification can land between the running
            // check and the wait, so never sleep unbounded
            let mut guard = shared.wait.lock();
            if shared.queue.is_empty() && shared.running.load(Ordering::Acquire) {
                shared
                    .wake
                    .wait_for(&mut guard, std::time::Duration::from_millis(50));
            }
        }
        shared.drain();
    }
    shared.drain();
    debug!("keys-indexer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use crate::types::BLOCK_TYPE_AUTO;

    fn new_table() -> BlockChains {
        BlockChains::new(Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_insert_and_lookup() {
        let table = new_table();
        table.insert(b"alpha", 1, b"", BLOCK_TYPE_AUTO).unwrap();
        table.insert(b"alpha", 3, b"", BLOCK_TYPE_AUTO).unwrap();
        table.insert(b"beta", 2, b"", BLOCK_TYPE_AUTO).unwrap();

        let stats = table.get_key_stats(b"alpha");
        assert_eq!(stats.count, 2);
        assert_eq!(stats.block_type, 0);
        assert!(table.get_key_stats(b"gamma").is_absent());
    }

    #[test]
    fn test_block_type_conflict() {
        let table = new_table();
        table.insert(b"alpha", 1, b"", BLOCK_TYPE_AUTO).unwrap();
        let err = table
            .insert(b"alpha", 2, b"payload", BLOCK_TYPE_AUTO)
            .unwrap_err();
        assert!(matches!(err, StrataError::BlockTypeMismatch { .. }));
    }

    #[test]
    fn test_key_set_glob() {
        let table = new_table();
        for key in [&b"apple"[..], b"apricot", b"banana", b"berry"] {
            table.insert(key, 1, b"", BLOCK_TYPE_AUTO).unwrap();
        }
        table.stop();

        assert_eq!(
            table.key_set(b"ap*"),
            vec![b"apple".to_vec(), b"apricot".to_vec()]
        );
        assert_eq!(table.key_set(b"*").len(), 4);
        assert!(table.key_set(b"cherry*").is_empty());
    }

    #[test]
    fn test_remove_drops_empty_keys() {
        let table = new_table();
        table.insert(b"alpha", 1, b"", BLOCK_TYPE_AUTO).unwrap();
        table.insert(b"beta", 1, b"", BLOCK_TYPE_AUTO).unwrap();
        table.insert(b"beta", 2, b"", BLOCK_TYPE_AUTO).unwrap();
        table.stop();

        let deleted = Bitmap::new(8);
        deleted.set(1);
        table.remove(&deleted);

        assert_eq!(table.key_count(), 1);
        assert_eq!(table.get_key_stats(b"beta").count, 1);
        // The hook survives in the hash table but reports no live postings
        assert_eq!(table.get_key_stats(b"alpha").count, 0);
    }

    #[test]
    fn test_serialize_simple_block() {
        let table = new_table();
        table.insert(b"word", 3, b"", BLOCK_TYPE_AUTO).unwrap();
        table.insert(b"word", 4, b"", BLOCK_TYPE_AUTO).unwrap();
        table.insert(b"word", 9, b"", BLOCK_TYPE_AUTO).unwrap();
        table.stop();

        let storage = MemoryStorage::new();
        let mut store = storage.create_store().unwrap();
        table.serialize(store.as_mut()).unwrap();
        let segment = store.commit().unwrap();

        // Deltas 2, 0, 4: one vbyte each
        assert_eq!(segment.chains.as_ref(), &[0x82, 0x80, 0x84]);
    }

    #[test]
    fn test_concurrent_key_creation() {
        let table = Arc::new(new_table());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        let key = format!("key-{}", i % 50);
                        table
                            .insert(key.as_bytes(), t * 200 + i + 1, b"", BLOCK_TYPE_AUTO)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        table.stop();
        assert!(table.verify());
        assert_eq!(table.key_count(), 50);

        let total: u32 = (0..50)
            .map(|i| table.get_key_stats(format!("key-{i}").as_bytes()).count)
            .sum();
        assert_eq!(total, 8 * 200);
    }
}
