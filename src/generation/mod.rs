//! Bounded mutable generations

mod bitmap;
mod entities;
mod index;

pub use bitmap::Bitmap;
pub use entities::EntityTable;
pub use index::MutableIndex;
