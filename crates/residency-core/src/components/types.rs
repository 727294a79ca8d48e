//! Component descriptors and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a component is; only used to weight its eviction priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Attention,
    Embedding,
    FeedForward,
    Normalization,
    Output,
    Other,
}

impl ComponentKind {
    /// Relative reconstruction cost in 0.0..=1.0. Expensive kinds score
    /// higher and are kept longer.
    pub fn weight(&self) -> f64 {
        match self {
            ComponentKind::Embedding => 1.0,
            ComponentKind::Attention => 0.8,
            ComponentKind::Output => 0.7,
            ComponentKind::FeedForward => 0.6,
            ComponentKind::Other => 0.5,
            ComponentKind::Normalization => 0.2,
        }
    }
}

/// Registration request for a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub kind: ComponentKind,
    pub size_bytes: u64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Storage location for the component's checkpoint.
    #[serde(default)]
    pub checkpoint_location: Option<String>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, kind: ComponentKind, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            size_bytes,
            dependencies: Vec::new(),
            checkpoint_location: None,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_checkpoint(mut self, location: impl Into<String>) -> Self {
        self.checkpoint_location = Some(location.into());
        self
    }

    /// Checkpoint at `components/<name>.ckpt`.
    pub fn with_default_checkpoint(self) -> Self {
        let location = format!("components/{}.ckpt", self.name);
        self.with_checkpoint(location)
    }
}

/// Point-in-time view of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub kind: ComponentKind,
    pub size_bytes: u64,
    pub is_loaded: bool,
    pub dependencies: Vec<String>,
    /// Registered components that depend on this one.
    pub dependents: Vec<String>,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    pub priority: f64,
    pub checkpoint_location: Option<String>,
}

/// An eviction candidate, lowest priority first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnloadCandidate {
    pub name: String,
    pub size_bytes: u64,
    pub priority: f64,
}

/// What a pressure check did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureReport {
    pub system_usage_fraction: f64,
    pub unloaded: Vec<String>,
    /// Candidates the dependency check (or a failed checkpoint) refused.
    pub rejected: Vec<String>,
    pub bytes_reclaimed: u64,
}
