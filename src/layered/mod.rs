pub mod committing;
pub mod index;
pub mod layers;

pub use committing::CommittingIndex;
pub use index::LayeredIndex;
pub use layers::{token_of, IndexLayers, LayerEntry};
