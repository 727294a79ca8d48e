//! Centralized configuration for the residency manager.
//!
//! Every tunable (budgets, chunk size, retry counts, thresholds, retention
//! windows, per-language default artifacts) lives here. Defaults are exposed
//! as associated constants so callers can reference them without building a
//! whole config.

use crate::error::{ResidencyError, Result};
use crate::storage::atomic::{atomic_read_json, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Memory sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Resident memory budget for the whole process.
    pub memory_budget_bytes: u64,
    /// How long a memory sample is reused before the OS is queried again.
    pub sample_ttl_ms: u64,
}

impl MonitorSettings {
    pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 4 * GIB;
    pub const DEFAULT_SAMPLE_TTL_MS: u64 = 250;

    pub fn sample_ttl(&self) -> Duration {
        Duration::from_millis(self.sample_ttl_ms)
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            memory_budget_bytes: Self::DEFAULT_MEMORY_BUDGET_BYTES,
            sample_ttl_ms: Self::DEFAULT_SAMPLE_TTL_MS,
        }
    }
}

/// Tiered cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Memory tier budget.
    pub memory_budget_bytes: u64,
    /// Secondary (durable) tier budget.
    pub secondary_budget_bytes: u64,
    /// Entries up to `memory_budget × promotion_fraction` may be promoted
    /// from the secondary tier on a hit.
    pub promotion_fraction: f64,
    /// Entries up to `memory_budget × memory_admission_fraction` are admitted
    /// to the memory tier by `put`; larger ones go straight to secondary.
    pub memory_admission_fraction: f64,
    /// Whether memory-tier evictions demote to the secondary tier.
    pub persistence_enabled: bool,
    /// System memory usage fraction that triggers a sweep eviction.
    pub high_water_fraction: f64,
    /// System memory usage fraction a sweep evicts down to.
    pub low_water_fraction: f64,
    /// Secondary occupancy fraction that triggers a retention purge.
    pub secondary_purge_fraction: f64,
    /// Entries unused for longer than this are purged under secondary pressure.
    pub retention_secs: u64,
    /// Number of appended index records after which the index is compacted.
    pub index_compact_threshold: usize,
}

impl CacheSettings {
    pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 4 * GIB;
    pub const DEFAULT_SECONDARY_BUDGET_BYTES: u64 = 100 * GIB;
    pub const DEFAULT_PROMOTION_FRACTION: f64 = 0.10;
    pub const DEFAULT_MEMORY_ADMISSION_FRACTION: f64 = 1.0;
    pub const DEFAULT_HIGH_WATER_FRACTION: f64 = 0.80;
    pub const DEFAULT_LOW_WATER_FRACTION: f64 = 0.70;
    pub const DEFAULT_SECONDARY_PURGE_FRACTION: f64 = 0.90;
    pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 3600;
    pub const DEFAULT_INDEX_COMPACT_THRESHOLD: usize = 1024;

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Largest entry eligible for promotion from the secondary tier.
    pub fn promotion_limit(&self) -> u64 {
        (self.memory_budget_bytes as f64 * self.promotion_fraction) as u64
    }

    /// Largest entry `put` admits to the memory tier.
    pub fn admission_limit(&self) -> u64 {
        (self.memory_budget_bytes as f64 * self.memory_admission_fraction) as u64
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_budget_bytes: Self::DEFAULT_MEMORY_BUDGET_BYTES,
            secondary_budget_bytes: Self::DEFAULT_SECONDARY_BUDGET_BYTES,
            promotion_fraction: Self::DEFAULT_PROMOTION_FRACTION,
            memory_admission_fraction: Self::DEFAULT_MEMORY_ADMISSION_FRACTION,
            persistence_enabled: true,
            high_water_fraction: Self::DEFAULT_HIGH_WATER_FRACTION,
            low_water_fraction: Self::DEFAULT_LOW_WATER_FRACTION,
            secondary_purge_fraction: Self::DEFAULT_SECONDARY_PURGE_FRACTION,
            retention_secs: Self::DEFAULT_RETENTION_SECS,
            index_compact_threshold: Self::DEFAULT_INDEX_COMPACT_THRESHOLD,
        }
    }
}

/// Resumable loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    pub chunk_size_bytes: u64,
    /// Attempts allowed per chunk after the first failure.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl LoaderSettings {
    pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 8 * MIB;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
    pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            chunk_size_bytes: Self::DEFAULT_CHUNK_SIZE_BYTES,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: Self::DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: Self::DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

/// Weights of the component eviction priority score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub recency: f64,
    pub frequency: f64,
    pub kind: f64,
    pub fan_in: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            recency: 0.4,
            frequency: 0.3,
            kind: 0.2,
            fan_in: 0.1,
        }
    }
}

/// Component unload manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentSettings {
    /// System memory usage fraction that triggers a pressure unload.
    pub pressure_threshold: f64,
    /// How many candidates a pressure check tries to unload.
    pub pressure_batch: usize,
    pub weights: PriorityWeights,
}

impl ComponentSettings {
    pub const DEFAULT_PRESSURE_THRESHOLD: f64 = 0.80;
    pub const DEFAULT_PRESSURE_BATCH: usize = 2;
}

impl Default for ComponentSettings {
    fn default() -> Self {
        Self {
            pressure_threshold: Self::DEFAULT_PRESSURE_THRESHOLD,
            pressure_batch: Self::DEFAULT_PRESSURE_BATCH,
            weights: PriorityWeights::default(),
        }
    }
}

/// Model lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Maximum number of constructed handles kept resident.
    pub max_warm: usize,
    /// Bytes reserved for a load when the request carries no limit.
    pub default_memory_limit_bytes: u64,
    pub load_timeout_secs: u64,
    /// Automatic retries after a constructor failure.
    pub construct_retries: u32,
    /// Language used for preloads of artifacts never loaded before.
    pub default_language: String,
    /// Language tag → default artifact name.
    pub default_models: HashMap<String, String>,
}

impl LifecycleSettings {
    pub const DEFAULT_MAX_WARM: usize = 2;
    pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 2 * GIB;
    pub const DEFAULT_LOAD_TIMEOUT_SECS: u64 = 300;
    pub const DEFAULT_CONSTRUCT_RETRIES: u32 = 1;

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    /// Default artifact configured for a language tag.
    pub fn default_model_for(&self, language: &str) -> Option<&str> {
        self.default_models.get(language).map(String::as_str)
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        let mut default_models = HashMap::new();
        default_models.insert("zh".to_string(), "qwen2.5-7b-instruct".to_string());
        default_models.insert("en".to_string(), "mistral-7b-instruct".to_string());
        Self {
            max_warm: Self::DEFAULT_MAX_WARM,
            default_memory_limit_bytes: Self::DEFAULT_MEMORY_LIMIT_BYTES,
            load_timeout_secs: Self::DEFAULT_LOAD_TIMEOUT_SECS,
            construct_retries: Self::DEFAULT_CONSTRUCT_RETRIES,
            default_language: "en".to_string(),
            default_models,
        }
    }
}

/// Predictive preloading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadSettings {
    /// Minimum fraction of the memory budget that must be free to preload.
    pub headroom_fraction: f64,
    /// Rolling access sequence length.
    pub history_limit: usize,
    /// Longest access context matched by the sequence strategy.
    pub ngram_order: usize,
    /// Scheduled loads due within this window are "imminent".
    pub schedule_horizon_secs: u64,
    pub max_predictions: usize,
    pub interval_secs: u64,
    /// Where usage history is persisted, if anywhere.
    pub history_file: Option<PathBuf>,
}

impl PreloadSettings {
    pub const DEFAULT_HEADROOM_FRACTION: f64 = 0.30;
    pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
    pub const DEFAULT_NGRAM_ORDER: usize = 3;
    pub const DEFAULT_SCHEDULE_HORIZON_SECS: u64 = 300;
    pub const DEFAULT_MAX_PREDICTIONS: usize = 3;
    pub const DEFAULT_INTERVAL_SECS: u64 = 30;

    pub fn schedule_horizon(&self) -> Duration {
        Duration::from_secs(self.schedule_horizon_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for PreloadSettings {
    fn default() -> Self {
        Self {
            headroom_fraction: Self::DEFAULT_HEADROOM_FRACTION,
            history_limit: Self::DEFAULT_HISTORY_LIMIT,
            ngram_order: Self::DEFAULT_NGRAM_ORDER,
            schedule_horizon_secs: Self::DEFAULT_SCHEDULE_HORIZON_SECS,
            max_predictions: Self::DEFAULT_MAX_PREDICTIONS,
            interval_secs: Self::DEFAULT_INTERVAL_SECS,
            history_file: None,
        }
    }
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub interval_secs: u64,
}

impl MaintenanceSettings {
    pub const DEFAULT_INTERVAL_SECS: u64 = 60;

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval_secs: Self::DEFAULT_INTERVAL_SECS,
        }
    }
}

/// Complete configuration for a [`crate::Residency`] instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    pub monitor: MonitorSettings,
    pub cache: CacheSettings,
    pub loader: LoaderSettings,
    pub components: ComponentSettings,
    pub lifecycle: LifecycleSettings,
    pub preload: PreloadSettings,
    pub maintenance: MaintenanceSettings,
}

impl ResidencyConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist. Missing fields take their default values.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let config = match atomic_read_json::<ResidencyConfig>(path)? {
            Some(config) => {
                info!("Loaded residency config from {}", path.display());
                config
            }
            None => ResidencyConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Persist configuration atomically.
    pub fn save_json_file(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self, true)
    }

    /// Validate ranges and sizes.
    pub fn validate(&self) -> Result<()> {
        fn fraction(field: &str, value: f64) -> Result<()> {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ResidencyError::Config {
                    message: format!("{} must be within 0.0..=1.0, got {}", field, value),
                });
            }
            Ok(())
        }
        fn non_zero(field: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(ResidencyError::Config {
                    message: format!("{} must be greater than zero", field),
                });
            }
            Ok(())
        }

        non_zero("monitor.memory_budget_bytes", self.monitor.memory_budget_bytes)?;
        non_zero("cache.memory_budget_bytes", self.cache.memory_budget_bytes)?;
        non_zero("loader.chunk_size_bytes", self.loader.chunk_size_bytes)?;
        non_zero("lifecycle.max_warm", self.lifecycle.max_warm as u64)?;
        non_zero("preload.ngram_order", self.preload.ngram_order as u64)?;
        non_zero("maintenance.interval_secs", self.maintenance.interval_secs)?;

        fraction("cache.promotion_fraction", self.cache.promotion_fraction)?;
        fraction(
            "cache.memory_admission_fraction",
            self.cache.memory_admission_fraction,
        )?;
        fraction("cache.high_water_fraction", self.cache.high_water_fraction)?;
        fraction("cache.low_water_fraction", self.cache.low_water_fraction)?;
        fraction(
            "cache.secondary_purge_fraction",
            self.cache.secondary_purge_fraction,
        )?;
        fraction(
            "components.pressure_threshold",
            self.components.pressure_threshold,
        )?;
        fraction("preload.headroom_fraction", self.preload.headroom_fraction)?;

        if self.cache.low_water_fraction > self.cache.high_water_fraction {
            return Err(ResidencyError::Config {
                message: "cache.low_water_fraction must not exceed cache.high_water_fraction"
                    .to_string(),
            });
        }
        Ok(())
    }
}
