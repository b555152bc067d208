//! Lock-free sorted posting chains
//!
//! A [`ChainHook`] anchors one key's chain of [`ChainLink`] nodes kept in
//! increasing entity-index order. Writers insert concurrently with pure
//! CAS loops and never block readers; nodes are never unlinked or freed
//! while the owning table is alive, so traversals need no guard beyond
//! holding the table.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, Ordering};

use crate::chains::Bitmap;
use crate::types::TOMBSTONE;

/// Number of sample points kept per chain
pub const CACHE_SIZE: usize = 32;

/// Rebuild the sample points every this many inserts
pub const CACHE_STEP: u32 = 64;

/// One posting node: entity index plus the opaque payload block.
///
/// `entity` is atomic only so a late tombstoning pass can overwrite it
/// while readers traverse; inserts treat it as immutable once linked.
pub struct ChainLink {
    next: AtomicPtr<ChainLink>,
    entity: AtomicU32,
    payload: Box<[u8]>,
}

impl ChainLink {
    fn alloc(entity: u32, payload: &[u8]) -> *mut ChainLink {
        Box::into_raw(Box::new(ChainLink {
            next: AtomicPtr::new(ptr::null_mut()),
            entity: AtomicU32::new(entity),
            payload: payload.into(),
        }))
    }

    pub fn entity(&self) -> u32 {
        self.entity.load(Ordering::Relaxed)
    }

    pub fn is_tombstone(&self) -> bool {
        self.entity() == TOMBSTONE
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn next_ptr(&self) -> *const ChainLink {
        self.next.load(Ordering::Acquire)
    }

    /// Approximate heap footprint, charged against the generation budget
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<ChainLink>() + self.payload.len()
    }
}

/// Anchor of one key's posting chain
pub struct ChainHook {
    key: Box<[u8]>,
    block_type: u32,
    /// Bucket collision chain, owned by the table
    next: AtomicPtr<ChainHook>,
    head: AtomicPtr<ChainLink>,
    count: AtomicU32,
    /// Evenly spaced entry points into the chain, valid up to `point_top`
    points: [AtomicPtr<ChainLink>; CACHE_SIZE],
    /// Highest valid slot in `points`; -1 while empty
    point_top: AtomicI32,
    /// Set while one thread rebuilds the points; inserts skip the cache
    building: AtomicBool,
}

impl ChainHook {
    pub fn new(key: &[u8], block_type: u32) -> Self {
        Self {
            key: key.into(),
            block_type,
            next: AtomicPtr::new(ptr::null_mut()),
            head: AtomicPtr::new(ptr::null_mut()),
            count: AtomicU32::new(0),
            points: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            point_top: AtomicI32::new(-1),
            building: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn block_type(&self) -> u32 {
        self.block_type
    }

    /// Live posting count (total inserts minus tombstones)
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn collision_next(&self) -> *const ChainHook {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_collision_next(&self, next: *mut ChainHook) {
        self.next.store(next, Ordering::Release)
    }

    pub fn first_ptr(&self) -> *const ChainLink {
        self.head.load(Ordering::Acquire)
    }

    pub fn iter(&self) -> LinkIter<'_> {
        LinkIter {
            cur: self.first_ptr(),
            _marker: PhantomData,
        }
    }

    /// Approximate heap footprint of the hook itself
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<ChainHook>() + self.key.len()
    }

    /// Lock-free sorted insert. Returns the bytes allocated for the new
    /// node so the caller can charge its budget.
    pub fn insert(&self, entity: u32, payload: &[u8]) -> usize {
        let newptr = ChainLink::alloc(entity, payload);
        let charged = unsafe { (*newptr).footprint() };

        // Empty chain: try to write the first element
        let mut pentry = match
            self.head
                .compare_exchange(ptr::null_mut(), newptr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.count.fetch_add(1, Ordering::AcqRel);
                return charged;
            }
            Err(current) => current,
        };

        // Consult the sample points for the deepest entry still below the
        // target, unless a rebuild is in flight
        if !self.building.load(Ordering::Acquire) {
            let mut slot = self.point_top.load(Ordering::Acquire);
            let mut cursor: *mut ChainLink = ptr::null_mut();
            while slot >= 0 {
                let sample = self.points[slot as usize].load(Ordering::Acquire);
                slot -= 1;
                if sample.is_null() {
                    cursor = ptr::null_mut();
                    break;
                }
                cursor = sample;
                if unsafe { (*sample).entity() } < entity {
                    break;
                }
            }
            if !cursor.is_null() && unsafe { (*cursor).entity() } < entity {
                pentry = cursor;
            } else {
                pentry = self.head.load(Ordering::Acquire);
            }
        }

        // The new element may sort before the current first: try prepend
        loop {
            let first = unsafe { &*pentry };
            if entity >= first.entity() {
                break;
            }
            unsafe { (*newptr).next.store(pentry, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                pentry,
                newptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.bump_count();
                    return charged;
                }
                Err(current) => pentry = current,
            }
        }

        // Walk forward to the link the new element goes after
        loop {
            let entry = unsafe { &*pentry };
            let follow = entry.next.load(Ordering::Acquire);

            if follow.is_null() || unsafe { (*follow).entity() } >= entity {
                unsafe { (*newptr).next.store(follow, Ordering::Relaxed) };
                if entry
                    .next
                    .compare_exchange_weak(follow, newptr, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.bump_count();
                    return charged;
                }
            } else {
                pentry = follow;
            }
        }
    }

    fn bump_count(&self) {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count % CACHE_STEP == 0 {
            self.markup();
        }
    }

    /// Rebuild the sample points with one walk over the chain. Only one
    /// builder runs at a time; losers return immediately.
    fn markup(&self) {
        if self
            .building
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let gran = ((self.count.load(Ordering::Acquire) as usize) / CACHE_SIZE).max(1);
        let mut slot = 0;
        let mut stride = 0;
        let mut cursor = self.head.load(Ordering::Acquire);

        while !cursor.is_null() && slot < CACHE_SIZE {
            stride += 1;
            if stride == gran {
                self.points[slot].store(cursor, Ordering::Release);
                slot += 1;
                stride = 0;
            }
            cursor = unsafe { (*cursor).next.load(Ordering::Acquire) };
        }

        self.point_top.store(slot as i32 - 1, Ordering::Release);
        self.building.store(false, Ordering::Release);
    }

    /// Strict monotonic order check over the whole chain
    pub fn verify(&self) -> bool {
        let mut last = 0u32;
        let mut seen_first = false;
        for link in self.iter() {
            let entity = link.entity();
            if seen_first && entity <= last {
                return false;
            }
            last = entity;
            seen_first = true;
        }
        true
    }

    /// Tombstone every posting whose entity is set in `deleted`.
    ///
    /// Runs after writers quiesce; readers may still traverse and observe
    /// the tombstones, which every cursor skips.
    pub fn remove(&self, deleted: &Bitmap) -> &Self {
        for link in self.iter() {
            let entity = link.entity();
            if entity != TOMBSTONE && deleted.get(entity) {
                link.entity.store(TOMBSTONE, Ordering::Release);
                self.count.fetch_sub(1, Ordering::AcqRel);
            }
        }
        self
    }
}

impl Drop for ChainHook {
    fn drop(&mut self) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            let link = unsafe { Box::from_raw(cursor) };
            cursor = link.next.load(Ordering::Acquire);
        }
    }
}

pub struct LinkIter<'a> {
    cur: *const ChainLink,
    _marker: PhantomData<&'a ChainHook>,
}

impl<'a> Iterator for LinkIter<'a> {
    type Item = &'a ChainLink;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        let link = unsafe { &*self.cur };
        self.cur = link.next_ptr();
        Some(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn collect(hook: &ChainHook) -> Vec<u32> {
        hook.iter()
            .filter(|l| !l.is_tombstone())
            .map(|l| l.entity())
            .collect()
    }

    #[test]
    fn test_sorted_insert() {
        let hook = ChainHook::new(b"word", 0);
        for entity in [5u32, 1, 9, 3, 7] {
            hook.insert(entity, b"");
        }
        assert_eq!(collect(&hook), vec![1, 3, 5, 7, 9]);
        assert_eq!(hook.count(), 5);
        assert!(hook.verify());
    }

    #[test]
    fn test_payload_preserved() {
        let hook = ChainHook::new(b"word", 0x10);
        hook.insert(2, b"beta");
        hook.insert(1, b"alpha");

        let postings: Vec<_> = hook.iter().map(|l| (l.entity(), l.payload().to_vec())).collect();
        assert_eq!(postings, vec![(1, b"alpha".to_vec()), (2, b"beta".to_vec())]);
    }

    #[test]
    fn test_remove_tombstones() {
        let hook = ChainHook::new(b"word", 0);
        for entity in 1..=6u32 {
            hook.insert(entity, b"");
        }

        let deleted = Bitmap::new(16);
        deleted.set(2);
        deleted.set(5);
        hook.remove(&deleted);

        assert_eq!(collect(&hook), vec![1, 3, 4, 6]);
        assert_eq!(hook.count(), 4);
    }

    #[test]
    fn test_markup_keeps_order() {
        let hook = ChainHook::new(b"word", 0);
        // Enough inserts to trigger several cache rebuilds
        for entity in (0..1000u32).rev() {
            hook.insert(entity, b"");
        }
        assert_eq!(hook.count(), 1000);
        assert!(hook.verify());
        assert_eq!(collect(&hook).len(), 1000);
    }

    #[test]
    fn test_concurrent_inserts() {
        let hook = Arc::new(ChainHook::new(b"word", 0));
        let threads = 8;
        let per_thread = 500u32;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let hook = Arc::clone(&hook);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        hook.insert(i * threads as u32 + t as u32, b"");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(hook.verify());
        assert_eq!(hook.count(), threads as u32 * per_thread);
        assert_eq!(collect(&hook).len(), (threads as u32 * per_thread) as usize);
    }
}
