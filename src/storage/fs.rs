//! Filesystem storage backend
//!
//! Each segment lives in its own `segment_NNN/` directory holding
//! `entities.bin`, `contents.bin`, `chains.bin` and a `checksum` file. A
//! store writes into a `.tmp` directory and renames it into place on
//! commit, so half-written segments are never listed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Result, StrataError};
use crate::storage::{IndexStore, SerializedSegment, Storage, Stream};

const SEGMENT_PREFIX: &str = "segment_";

pub struct FsStorage {
    base_dir: PathBuf,
    next_id: Mutex<u64>,
}

impl FsStorage {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        let storage = Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            next_id: Mutex::new(0),
        };
        let highest = storage
            .segment_ids()?
            .into_iter()
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);
        *storage.next_id.lock() = highest;
        Ok(storage)
    }

    fn segment_dir(&self, id: u64) -> PathBuf {
        self.base_dir.join(format!("{SEGMENT_PREFIX}{id}"))
    }

    fn segment_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix(SEGMENT_PREFIX) else {
                continue;
            };
            if let Ok(id) = suffix.parse::<u64>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn load_segment(&self, id: u64) -> Result<Arc<SerializedSegment>> {
        let dir = self.segment_dir(id);
        let entities = fs::read(dir.join("entities.bin"))?;
        let contents = fs::read(dir.join("contents.bin"))?;
        let chains = fs::read(dir.join("chains.bin"))?;
        let checksum_bytes = fs::read(dir.join("checksum"))?;
        let checksum = checksum_bytes
            .as_slice()
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| StrataError::Storage(format!("segment {id}: malformed checksum file")))?;

        let segment = SerializedSegment {
            entities: entities.into(),
            contents: contents.into(),
            chains: chains.into(),
            checksum,
        };
        if !segment.verify_checksum() {
            return Err(StrataError::Storage(format!(
                "segment {id}: checksum mismatch"
            )));
        }
        Ok(Arc::new(segment))
    }
}

impl Storage for FsStorage {
    fn create_store(&self) -> Result<Box<dyn IndexStore>> {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let final_dir = self.segment_dir(id);
        let tmp_dir = self.base_dir.join(format!("{SEGMENT_PREFIX}{id}.tmp"));
        fs::create_dir_all(&tmp_dir)?;
        Ok(Box::new(FsStore {
            tmp_dir,
            final_dir,
            entities: Vec::new(),
            contents: Vec::new(),
            chains: Vec::new(),
        }))
    }

    fn list_indices(&self) -> Result<Vec<Arc<SerializedSegment>>> {
        let mut segments = Vec::new();
        for id in self.segment_ids()? {
            match self.load_segment(id) {
                Ok(segment) => segments.push(segment),
                Err(e) => warn!(segment = id, error = %e, "skipping unreadable segment"),
            }
        }
        Ok(segments)
    }
}

struct FsStore {
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    entities: Vec<u8>,
    contents: Vec<u8>,
    chains: Vec<u8>,
}

impl IndexStore for FsStore {
    fn write(&mut self, stream: Stream, bytes: &[u8]) -> Result<()> {
        let buffer = match stream {
            Stream::Entities => &mut self.entities,
            Stream::Contents => &mut self.contents,
            Stream::Chains => &mut self.chains,
        };
        buffer.extend_from_slice(bytes);
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

        fs::write(self.tmp_dir.join("entities.bin"), &self.entities)?;
        fs::write(self.tmp_dir.join("contents.bin"), &self.contents)?;
        fs::write(self.tmp_dir.join("chains.bin"), &self.chains)?;
        fs::write(self.tmp_dir.join("checksum"), checksum.to_le_bytes())?;
        fs::rename(&self.tmp_dir, &self.final_dir)?;

        Ok(Arc::new(SerializedSegment {
            entities: self.entities.into(),
            contents: self.contents.into(),
            chains: self.chains.into(),
            checksum,
        }))
    }

    fn remove(self: Box<Self>) -> Result<()> {
        fs::remove_dir_all(&self.tmp_dir)?;
        Ok(())
    }
}
