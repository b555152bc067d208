//! Storage abstraction for serialized generations
//!
//! A generation serializes into three byte streams: the entity table, the
//! key dictionary (contents) and the posting blocks (chains). An
//! [`IndexStore`] collects the streams for one segment; [`Storage`] mints
//! stores and enumerates previously committed segments.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use std::sync::Arc;

use crate::error::Result;

/// One committed segment: the three streams plus a checksum over all of
/// them, computed at commit time and re-verified on load.
#[derive(Clone, Debug)]
pub struct SerializedSegment {
    pub entities: Arc<[u8]>,
    pub contents: Arc<[u8]>,
    pub chains: Arc<[u8]>,
    pub checksum: u32,
}

impl SerializedSegment {
    /// Checksum over the three streams in their fixed order
    pub fn compute_checksum(entities: &[u8], contents: &[u8], chains: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(entities);
        hasher.update(contents);
        hasher.update(chains);
        hasher.finalize()
    }

    pub fn verify_checksum(&self) -> bool {
        Self::compute_checksum(&self.entities, &self.contents, &self.chains) == self.checksum
    }

    pub fn total_bytes(&self) -> usize {
        self.entities.len() + self.contents.len() + self.chains.len()
    }
}

/// Identifies which of the three streams a write targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Entities,
    Contents,
    Chains,
}

/// Collects the byte streams of one segment being committed
pub trait IndexStore: Send {
    /// Append bytes to one of the segment's streams
    fn write(&mut self, stream: Stream, bytes: &[u8]) -> Result<()>;

    /// Bytes written to a stream so far
    fn position(&self, stream: Stream) -> u64;

    /// Seal the segment and make it durable
    fn commit(self: Box<Self>) -> Result<Arc<SerializedSegment>>;

    /// Abandon the segment, discarding anything written
    fn remove(self: Box<Self>) -> Result<()>;
}

/// A place segments live: mints stores for new commits and lists the
/// segments committed earlier
pub trait Storage: Send + Sync {
    fn create_store(&self) -> Result<Box<dyn IndexStore>>;

    /// Previously committed segments, oldest first
    fn list_indices(&self) -> Result<Vec<Arc<SerializedSegment>>>;
}
