//! Facade methods over the wired components.
//!
//! The struct definition lives in `lib.rs`; this module extends it.

mod builder;

pub use builder::ResidencyBuilder;

use crate::cache::TieredCache;
use crate::cancel::CancellationToken;
use crate::components::ComponentUnloadManager;
use crate::config::ResidencyConfig;
use crate::error::{ResidencyError, Result};
use crate::lifecycle::{LoadRequest, ModelConstructor, ModelLifecycleManager};
use crate::loader::ResumableLoader;
use crate::maintenance::{spawn_maintenance, MaintenanceHandle};
use crate::monitor::MemoryMonitor;
use crate::preload::Preloader;
use crate::storage::StorageBackend;
use crate::Residency;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

impl Residency {
    pub fn builder(constructor: Arc<dyn ModelConstructor>) -> ResidencyBuilder {
        ResidencyBuilder::new(constructor)
    }

    pub fn config(&self) -> &ResidencyConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<TieredCache<Bytes>> {
        &self.cache
    }

    pub fn components(&self) -> &Arc<ComponentUnloadManager> {
        &self.components
    }

    pub fn lifecycle(&self) -> &ModelLifecycleManager {
        &self.lifecycle
    }

    pub fn preloader(&self) -> &Arc<Preloader> {
        &self.preloader
    }

    /// Load and activate an artifact, recording the access for prediction.
    pub async fn load(&self, request: LoadRequest) -> Result<()> {
        self.preloader.record_usage(&request.name);
        self.lifecycle.try_load(request).await
    }

    /// Activate the default artifact for `language`, recording the access
    /// for prediction.
    pub async fn switch_to(&self, language: &str) -> Result<()> {
        if let Some(name) = self.lifecycle.settings().default_model_for(language) {
            self.preloader.record_usage(name);
        }
        self.lifecycle.try_switch_to(language).await
    }

    /// Open (or resume) the resumable load work directory for `artifact`.
    pub fn open_loader(&self, artifact: &str) -> Result<ResumableLoader> {
        let valid = !artifact.is_empty()
            && artifact
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && artifact != "."
            && artifact != "..";
        if !valid {
            return Err(ResidencyError::Validation {
                field: "artifact".to_string(),
                message: format!("{:?} is not a valid work directory name", artifact),
            });
        }
        let work_dir = self.root.join(builder::LOADS_DIR).join(artifact);
        ResumableLoader::open(work_dir, self.config.loader.clone())
    }

    /// Spawn the maintenance worker and the preload loop.
    ///
    /// Both stop when the returned handle is shut down; the preload loop
    /// notices at its next tick.
    pub fn start_maintenance(&self) -> MaintenanceHandle {
        let cancel = CancellationToken::new();
        let handle = spawn_maintenance(
            Arc::clone(&self.cache),
            Arc::clone(&self.components),
            self.config.maintenance.interval(),
            cancel.clone(),
        );
        let _preload_loop = Arc::clone(&self.preloader).spawn_loop(self.config.preload.interval(), cancel);
        handle
    }

    /// Tear down every resident handle and persist usage history.
    pub fn shutdown(&self) {
        self.lifecycle.cleanup();
        if let Some(path) = &self.config.preload.history_file {
            if let Err(e) = self.preloader.save_history(path) {
                tracing::warn!("Failed to save usage history: {}", e);
            }
        }
    }
}
