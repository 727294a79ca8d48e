//! Durable storage: atomic file helpers and blob backends.

pub mod atomic;
mod backend;

pub use backend::{FsStorage, MemoryStorage, StorageBackend};
