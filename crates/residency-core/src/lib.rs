//! Residency Core - budgeted residency management for large model artifacts.
//!
//! Decides what stays resident in memory, what is demoted to secondary
//! storage and what is evicted, under a hard memory budget:
//!
//! - [`TieredCache`]: byte-bounded memory tier over a durable secondary tier.
//! - [`ResumableLoader`]: checksum-verified chunked loading that survives
//!   interruption.
//! - [`ComponentUnloadManager`]: dependency-aware partial unload of the
//!   components of a loaded model.
//! - [`ModelLifecycleManager`]: one active handle, a bounded warm set and
//!   timed construction.
//! - [`Preloader`]: history-driven speculative loads.
//! - [`MappedArtifact`]: zero-copy access to finalized artifacts.
//!
//! # Example
//!
//! ```rust,ignore
//! use residency_core::{LoadRequest, Residency};
//!
//! #[tokio::main]
//! async fn main() -> residency_core::Result<()> {
//!     let residency = Residency::builder(constructor).root("./residency").build()?;
//!     let maintenance = residency.start_maintenance();
//!
//!     residency.load(LoadRequest::new("mistral-7b-instruct", "en")).await?;
//!     let handle = residency.lifecycle().active_handle();
//!
//!     maintenance.shutdown().await;
//!     residency.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod checksum;
pub mod components;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod logging;
pub mod maintenance;
pub mod monitor;
pub mod preload;
pub mod retry;
pub mod storage;

mod api;
pub(crate) mod sync;

// Re-export commonly used types
pub use cache::{CacheStats, CacheValue, SweepReport, Tier, TieredCache};
pub use cancel::{CancellationToken, CancelledError};
pub use checksum::{Checksum, ChecksumAlgorithm};
pub use components::{
    ComponentHost, ComponentKind, ComponentSpec, ComponentStatus, ComponentUnloadManager,
    PressureReport, UnloadCandidate,
};
pub use config::{
    CacheSettings, ComponentSettings, LifecycleSettings, LoaderSettings, MaintenanceSettings,
    MonitorSettings, PreloadSettings, ResidencyConfig,
};
pub use error::{ResidencyError, Result};
pub use lifecycle::{
    Disposable, LifecycleStats, LoadRequest, ModelConstructor, ModelHandle, ModelLifecycleManager,
    ModelSnapshot, ResidencyState,
};
pub use loader::{ChunkOutcome, ChunkSource, LoadProgress, LoadState, MappedArtifact, ResumableLoader};
pub use maintenance::{MaintenanceHandle, MaintenanceReport};
pub use monitor::{MemoryMonitor, MemoryProbe, MemorySample};
pub use preload::{PreloadStats, PreloadStrategy, Preloader};
pub use storage::{FsStorage, MemoryStorage, StorageBackend};

// Re-export builder from api module
pub use api::ResidencyBuilder;

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

/// The residency manager: every component wired to one memory monitor and
/// one configuration.
///
/// Built with [`Residency::builder`]. Components are shared (`Arc`) and may
/// be handed to other tasks.
pub struct Residency {
    pub(crate) config: ResidencyConfig,
    pub(crate) root: PathBuf,
    pub(crate) monitor: Arc<MemoryMonitor>,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) cache: Arc<TieredCache<Bytes>>,
    pub(crate) components: Arc<ComponentUnloadManager>,
    pub(crate) lifecycle: ModelLifecycleManager,
    pub(crate) preloader: Arc<Preloader>,
}

impl std::fmt::Debug for Residency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Residency")
            .field("root", &self.root)
            .field("monitor", &self.monitor)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}
