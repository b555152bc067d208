//! The contract between an entity's content and the index
//!
//! Callers hand the index a [`Contents`] implementation; during
//! `set_entity` the index drives `enumerate`, and every key the content
//! pushes into the sink becomes a posting for the entity being written.

use crate::error::Result;
use crate::types::BLOCK_TYPE_AUTO;

/// Receives the key/payload pairs a [`Contents`] wants indexed
pub trait IndexSink {
    /// Record one posting for the entity under `key`.
    ///
    /// `block_type` must agree with the type previously established for
    /// the key; pass [`BLOCK_TYPE_AUTO`] to let the index pick one on the
    /// key's first insert.
    fn insert(&mut self, key: &[u8], payload: &[u8], block_type: u32) -> Result<()>;
}

/// Anything that can enumerate its indexable keys
pub trait Contents {
    fn enumerate(&self, sink: &mut dyn IndexSink) -> Result<()>;
}

/// Ready-made [`Contents`] over a list of `(key, payload, block_type)`
/// triples. Convenient for tests and simple embedders.
#[derive(Clone, Debug, Default)]
pub struct PairsContents {
    pairs: Vec<(Vec<u8>, Vec<u8>, u32)>,
}

impl PairsContents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key with no payload, letting the index pick the block type
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.pairs.push((key.into(), Vec::new(), BLOCK_TYPE_AUTO));
        self
    }

    /// Add a key carrying a per-posting payload
    pub fn with_pair(mut self, key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        self.pairs.push((key.into(), payload.into(), BLOCK_TYPE_AUTO));
        self
    }

    /// Add a key with an explicit block type
    pub fn with_typed(
        mut self,
        key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
        block_type: u32,
    ) -> Self {
        self.pairs.push((key.into(), payload.into(), block_type));
        self
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl Contents for PairsContents {
    fn enumerate(&self, sink: &mut dyn IndexSink) -> Result<()> {
        for (key, payload, block_type) in &self.pairs {
            sink.insert(key, payload, *block_type)?;
        }
        Ok(())
    }
}
