//! Lock-free posting chains and the per-generation key table

mod chain;
mod table;

pub use chain::{ChainHook, ChainLink, LinkIter, CACHE_SIZE, CACHE_STEP};
pub use table::{BlockChains, KeyMeta};

pub use crate::generation::Bitmap;
