//! In-memory storage backend for tests and fully embedded use

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{IndexStore, SerializedSegment, Storage, Stream};

/// Keeps committed segments in a shared `Vec`
#[derive(Clone, Default)]
pub struct MemoryStorage {
    segments: Arc<Mutex<Vec<Arc<SerializedSegment>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.lock().len()
    }
}

impl Storage for MemoryStorage {
    fn create_store(&self) -> Result<Box<dyn IndexStore>> {
        Ok(Box::new(MemoryStore {
            segments: Arc::clone(&self.segments),
            entities: Vec::new(),
            contents: Vec::new(),
            chains: Vec::new(),
        }))
    }

    fn list_indices(&self) -> Result<Vec<Arc<SerializedSegment>>> {
        Ok(self.segments.lock().clone())
    }
}

struct MemoryStore {
    segments: Arc<Mutex<Vec<Arc<SerializedSegment>>>>,
    entities: Vec<u8>,
    contents: Vec<u8>,
    chains: Vec<u8>,
}

impl MemoryStore {
    fn buffer(&mut self, stream: Stream) -> &mut Vec<u8> {
        match stream {
            Stream::Entities => &mut self.entities,
            Stream::Contents => &mut self.contents,
            Stream::Chains => &mut self.chains,
        }
    }
}

impl IndexStore for MemoryStore {
    fn write(&mut self, stream: Stream, bytes: &[u8]) -> Result<()> {
        self.buffer(stream).extend_from_slice(bytes);
        Ok(())
    }

    fn position(&self, stream: Stream) -> u64 {
        let len = match stream {
            Stream::Entities => self.entities.len(),
            Stream::Contents => self.contents.len(),
            Stream::Chains => self.chains.len(),
        };
        len as u64
    }

    fn commit(self: Box<Self>) -> Result<Arc<SerializedSegment>> {
        let checksum =
            SerializedSegment::compute_checksum(&self.entities, &self.contents, &self.chains);
        let segment = Arc::new(SerializedSegment {
            entities: self.entities.into(),
            contents: self.contents.into(),
            chains: self.chains.into(),
            checksum,
        });
        self.segments.lock().push(Arc::clone(&segment));
        Ok(segment)
    }

    fn remove(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
