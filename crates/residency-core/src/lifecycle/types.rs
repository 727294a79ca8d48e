//! Handle contracts, load requests and lifecycle snapshots.

use crate::cancel::CancellationToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Explicit teardown.
///
/// The registry calls `dispose` exactly once when it evicts a handle, before
/// dropping its reference. Implementations release memory, file mappings and
/// device buffers here rather than relying on `Drop` ordering.
pub trait Disposable {
    fn dispose(&self);
}

/// A constructed model-like object. The core never inspects it beyond its
/// reported footprint and teardown hook.
pub trait ModelHandle: Disposable + Send + Sync {
    /// Resident bytes attributable to this handle.
    fn memory_footprint(&self) -> u64;
}

/// Builds handles on demand.
#[async_trait]
pub trait ModelConstructor: Send + Sync {
    /// Construct `name` for `language`.
    ///
    /// `cancel` is triggered when the load times out; constructors should
    /// check it between expensive steps.
    async fn construct(
        &self,
        name: &str,
        language: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<dyn ModelHandle>>;

    /// Called after handles are torn down so the backend can return freed
    /// memory to the OS.
    fn reclaim(&self) {}
}

/// A request to make an artifact resident and active.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub name: String,
    pub language: String,
    /// Rebuild even if a warm handle exists.
    pub force: bool,
    /// Bytes that must be available before constructing.
    pub memory_limit: Option<u64>,
    pub timeout: Option<Duration>,
}

impl LoadRequest {
    pub fn new(name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: language.into(),
            force: false,
            memory_limit: None,
            timeout: None,
        }
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A resident handle and its bookkeeping. Owned by the warm set until
/// eviction hands it to teardown.
#[derive(Clone)]
pub struct ModelInfo {
    pub name: String,
    pub language: String,
    pub memory_usage_bytes: u64,
    pub load_time: Duration,
    pub loaded_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub is_active: bool,
    pub handle: Arc<dyn ModelHandle>,
}

impl std::fmt::Debug for ModelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInfo")
            .field("name", &self.name)
            .field("language", &self.language)
            .field("memory_usage_bytes", &self.memory_usage_bytes)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

impl ModelInfo {
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            name: self.name.clone(),
            language: self.language.clone(),
            memory_usage_bytes: self.memory_usage_bytes,
            load_time_ms: self.load_time.as_millis() as u64,
            loaded_at: self.loaded_at,
            last_used: self.last_used,
            is_active: self.is_active,
        }
    }
}

/// Serializable view of a [`ModelInfo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub name: String,
    pub language: String,
    pub memory_usage_bytes: u64,
    pub load_time_ms: u64,
    pub loaded_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub is_active: bool,
}

/// Where an artifact is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidencyState {
    Absent,
    Loading,
    Warm,
    Active,
}

/// Lifecycle counters and current residency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleStats {
    /// Successful constructions.
    pub loads: u64,
    /// Requests served from the warm set.
    pub cache_hits: u64,
    /// Loads that failed after retries.
    pub failures: u64,
    pub timeouts: u64,
    /// Handles torn down.
    pub evictions: u64,
    /// Foreground loads that adopted an in-flight preload.
    pub joined_preloads: u64,
    pub preloads_started: u64,
    /// Queued preloads discarded under memory pressure.
    pub preloads_dropped: u64,
    pub active: Option<String>,
    /// Warm names, least recently used first.
    pub warm: Vec<String>,
    pub warm_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_request_builder() {
        let request = LoadRequest::new("mistral-7b-instruct", "en")
            .force()
            .with_memory_limit(1024)
            .with_timeout(Duration::from_secs(5));
        assert!(request.force);
        assert_eq!(request.memory_limit, Some(1024));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }
}
