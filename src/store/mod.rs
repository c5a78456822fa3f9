// src/store/mod.rs

pub mod cache;
pub mod keys;
pub mod lock;
pub mod object;
pub mod omap;

pub use cache::LocalState;
pub use lock::OmapLock;
pub use object::{MemoryObjectStore, ObjectStore};
pub use omap::OmapState;
