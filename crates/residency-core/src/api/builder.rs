//! Builder for wiring a [`Residency`] from one configuration.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::TieredCache;
use crate::components::{ComponentHost, ComponentUnloadManager};
use crate::config::ResidencyConfig;
use crate::error::{ResidencyError, Result};
use crate::lifecycle::{ModelConstructor, ModelLifecycleManager};
use crate::monitor::{MemoryMonitor, MemoryProbe, SysinfoProbe};
use crate::preload::Preloader;
use crate::storage::{FsStorage, MemoryStorage, StorageBackend};
use crate::Residency;

/// Directory under the root holding secondary-tier blobs and checkpoints.
pub(crate) const STORE_DIR: &str = "store";
/// Secondary-tier index log under the root.
pub(crate) const INDEX_FILE: &str = "cache-index.jsonl";
/// Directory under the root holding resumable load work directories.
pub(crate) const LOADS_DIR: &str = "loads";

/// Builder for configuring [`Residency`] initialization.
///
/// # Example
///
/// ```rust,ignore
/// use residency_core::{Residency, ResidencyConfig};
///
/// let residency = Residency::builder(constructor)
///     .config(ResidencyConfig::from_json_file(&config_path)?)
///     .root("/var/lib/my-app/residency")
///     .build()?;
/// let maintenance = residency.start_maintenance();
/// ```
pub struct ResidencyBuilder {
    constructor: Arc<dyn ModelConstructor>,
    config: ResidencyConfig,
    root: Option<PathBuf>,
    probe: Option<Arc<dyn MemoryProbe>>,
    storage: Option<Arc<dyn StorageBackend>>,
    host: Option<Arc<dyn ComponentHost>>,
}

impl ResidencyBuilder {
    /// Create a builder around the artifact constructor.
    pub fn new(constructor: Arc<dyn ModelConstructor>) -> Self {
        Self {
            constructor,
            config: ResidencyConfig::default(),
            root: None,
            probe: None,
            storage: None,
            host: None,
        }
    }

    pub fn config(mut self, config: ResidencyConfig) -> Self {
        self.config = config;
        self
    }

    /// Directory for durable state: secondary-tier blobs, the cache index,
    /// component checkpoints and resumable loads.
    ///
    /// Default: the platform cache directory.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Memory source. Default: process and system memory via `sysinfo`.
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Blob storage for the secondary tier and checkpoints.
    ///
    /// Default: a directory under the root. With a custom backend the cache
    /// index is kept in memory only.
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Snapshot/restore hooks for partially unloadable components.
    pub fn component_host(mut self, host: Arc<dyn ComponentHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Build the instance. Does not start background work.
    pub fn build(self) -> Result<Residency> {
        self.config.validate()?;
        let config = self.config;
        let root = self.root.unwrap_or_else(FsStorage::default_root);

        let monitor = Arc::new(match self.probe {
            Some(probe) => MemoryMonitor::new(probe, &config.monitor),
            None => MemoryMonitor::new(SysinfoProbe::new(), &config.monitor),
        });

        let (storage, index_path): (Arc<dyn StorageBackend>, Option<PathBuf>) =
            match (self.storage, config.cache.persistence_enabled) {
                (Some(storage), _) => (storage, None),
                (None, true) => (
                    Arc::new(FsStorage::new(root.join(STORE_DIR))?),
                    Some(root.join(INDEX_FILE)),
                ),
                (None, false) => (Arc::new(MemoryStorage::new()), None),
            };

        let cache = if config.cache.persistence_enabled {
            TieredCache::with_storage(
                config.cache.clone(),
                Arc::clone(&monitor),
                Arc::clone(&storage),
                index_path,
            )?
        } else {
            TieredCache::new(config.cache.clone(), Arc::clone(&monitor))
        };
        if let Some(report) = cache.recovery() {
            if report.missing_storage > 0 || report.corrupt_lines > 0 {
                tracing::warn!(
                    "Cache index recovery dropped {} missing and {} corrupt records",
                    report.missing_storage,
                    report.corrupt_lines
                );
            }
        }

        let mut components =
            ComponentUnloadManager::new(config.components.clone(), Arc::clone(&monitor))
                .with_storage(Arc::clone(&storage));
        if let Some(host) = self.host {
            components = components.with_host(host);
        }
        let components = Arc::new(components);

        let lifecycle = ModelLifecycleManager::with_components(
            config.lifecycle.clone(),
            Arc::clone(&monitor),
            self.constructor,
            Arc::clone(&components),
        );

        let preloader = Preloader::new(config.preload.clone(), Arc::clone(&monitor), lifecycle.clone());
        if let Some(path) = &config.preload.history_file {
            if let Err(e) = preloader.load_history(path) {
                tracing::warn!("Failed to load usage history (non-fatal): {}", e);
            }
        }

        let loads_dir = root.join(LOADS_DIR);
        std::fs::create_dir_all(&loads_dir).map_err(|e| ResidencyError::Storage {
            message: format!("Failed to create loads directory: {}", loads_dir.display()),
            path: Some(loads_dir.clone()),
            source: Some(e),
        })?;

        tracing::info!(
            root = %root.display(),
            budget = config.monitor.memory_budget_bytes,
            "Residency manager ready"
        );

        Ok(Residency {
            config,
            root,
            monitor,
            storage,
            cache: Arc::new(cache),
            components,
            lifecycle,
            preloader: Arc::new(preloader),
        })
    }
}
