pub mod chunk;
pub mod file_store;
pub mod hash;

pub use chunk::{Chunk, split};
pub use file_store::FileStore;
pub use hash::HashUtils;
