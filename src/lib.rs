//! Embeddable layered inverted-index storage engine.
//!
//! Writes land in a bounded mutable generation built on lock-free posting
//! chains. When a generation overflows it rotates into a background
//! commit, producing an immutable serialized segment; a monitor thread
//! merges adjacent segments with a k-way fusion pass. [`LayeredIndex`]
//! ties the whole stack together behind the [`ContentsIndex`] trait.

pub mod chains;
pub mod codec;
pub mod config;
pub mod contents;
pub mod error;
pub mod fusion;
pub mod generation;
pub mod index;
pub mod layered;
pub mod notify;
pub mod segment;
pub mod storage;
pub mod strmatch;
pub mod types;

pub use config::{MonitorConfig, Settings};
pub use contents::{Contents, IndexSink, PairsContents};
pub use error::{Result, StrataError};
pub use fusion::{MergeOutcome, Merger};
pub use index::{ContentsIndex, EntityCursor, LayerKind};
pub use layered::LayeredIndex;
pub use segment::SegmentIndex;
pub use storage::{FsStorage, MemoryStorage, SerializedSegment, Storage};
pub use types::{BlockInfo, Entity, EntityId, BLOCK_TYPE_AUTO, BLOCK_TYPE_CHAINS, BLOCK_TYPE_SIMPLE};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
