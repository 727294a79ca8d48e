//! Resumable, checksum-verified chunked loading and mapped artifact access.

mod mapped;
mod resumable;
mod task;

pub use mapped::{MappedArtifact, MappedBytes};
pub use resumable::{ChunkOutcome, ChunkSource, ResumableLoader};
pub use task::{LoadCounters, LoadProgress, LoadState, LoadingTask};
