//! Dependency-aware partial unload of a loaded object's components.
//!
//! The graph is a DAG by construction: a component may only depend on
//! components registered before it. Unloading a component is refused while
//! any loaded or reloading component depends on it; reloading brings
//! dependencies back first. Checkpoint I/O and host callbacks run outside
//! the graph lock, with the component marked busy so no other transition can
//! interleave.

use super::types::{ComponentKind, ComponentSpec, ComponentStatus, PressureReport, UnloadCandidate};
use crate::config::{ComponentSettings, PriorityWeights};
use crate::error::{ResidencyError, Result};
use crate::monitor::MemoryMonitor;
use crate::storage::StorageBackend;
use crate::sync::lock;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// The object whose components are being managed.
///
/// Implemented by whatever owns the component's memory. Without a host the
/// manager only does bookkeeping.
pub trait ComponentHost: Send + Sync {
    /// Serialize a component's state for its checkpoint.
    fn snapshot(&self, name: &str) -> Result<Vec<u8>>;

    /// Bring a component back, from its checkpoint when one exists.
    fn restore(&self, name: &str, checkpoint: Option<&[u8]>) -> Result<()>;

    /// Free a component's memory after it has been checkpointed.
    fn release(&self, name: &str);
}

#[derive(Debug)]
struct ComponentNode {
    kind: ComponentKind,
    size_bytes: u64,
    dependencies: Vec<String>,
    checkpoint_location: Option<String>,
    last_access: DateTime<Utc>,
    access_count: u64,
    is_loaded: bool,
    /// A checkpoint or restore is in flight.
    busy: bool,
}

type Graph = HashMap<String, ComponentNode>;

fn dependents_of<'a>(graph: &'a Graph, name: &str) -> impl Iterator<Item = (&'a String, &'a ComponentNode)> {
    let name = name.to_string();
    graph
        .iter()
        .filter(move |(_, node)| node.dependencies.iter().any(|d| *d == name))
}

/// A dependent that is loaded, or mid-transition, pins its dependencies.
fn is_live(node: &ComponentNode) -> bool {
    node.is_loaded || node.busy
}

fn priority(node: &ComponentNode, fan_in: usize, now: DateTime<Utc>, weights: &PriorityWeights) -> f64 {
    let idle_secs = (now - node.last_access).num_milliseconds().max(0) as f64 / 1000.0;
    let recency = 1.0 / (idle_secs + 1.0);
    let inverse_frequency = 1.0 / (node.access_count as f64 + 1.0);
    let fan_in = fan_in as f64 / (fan_in as f64 + 1.0);
    weights.recency * recency
        + weights.frequency * inverse_frequency
        + weights.kind * node.kind.weight()
        + weights.fan_in * fan_in
}

/// Tracks components, their dependency edges and eviction priority.
pub struct ComponentUnloadManager {
    settings: ComponentSettings,
    monitor: Arc<MemoryMonitor>,
    graph: Mutex<Graph>,
    storage: Option<Arc<dyn StorageBackend>>,
    host: Option<Arc<dyn ComponentHost>>,
    checking_pressure: AtomicBool,
}

impl ComponentUnloadManager {
    pub fn new(settings: ComponentSettings, monitor: Arc<MemoryMonitor>) -> Self {
        Self {
            settings,
            monitor,
            graph: Mutex::new(HashMap::new()),
            storage: None,
            host: None,
            checking_pressure: AtomicBool::new(false),
        }
    }

    /// Store checkpoints in `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Delegate snapshot/restore/release to `host`.
    pub fn with_host(mut self, host: Arc<dyn ComponentHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Register a loaded component.
    ///
    /// Returns `Ok(false)` with a warning if the name is already registered;
    /// the existing entry is left untouched. Every dependency must already be
    /// registered, which keeps the graph acyclic.
    pub fn register(&self, spec: ComponentSpec) -> Result<bool> {
        let mut graph = lock(&self.graph);
        if graph.contains_key(&spec.name) {
            warn!(component = %spec.name, "Component already registered; ignoring");
            return Ok(false);
        }
        if let Some(missing) = spec
            .dependencies
            .iter()
            .find(|d| **d == spec.name || !graph.contains_key(*d))
        {
            return Err(ResidencyError::Validation {
                field: "dependencies".to_string(),
                message: format!(
                    "{} depends on {}, which is not a registered component",
                    spec.name, missing
                ),
            });
        }

        debug!(
            component = %spec.name,
            kind = ?spec.kind,
            bytes = spec.size_bytes,
            "Registered component"
        );
        graph.insert(
            spec.name,
            ComponentNode {
                kind: spec.kind,
                size_bytes: spec.size_bytes,
                dependencies: spec.dependencies,
                checkpoint_location: spec.checkpoint_location,
                last_access: Utc::now(),
                access_count: 0,
                is_loaded: true,
                busy: false,
            },
        );
        Ok(true)
    }

    /// Record an access and run a pressure check. Returns `false` for an
    /// unknown component.
    pub fn touch(&self, name: &str) -> bool {
        {
            let mut graph = lock(&self.graph);
            let Some(node) = graph.get_mut(name) else {
                return false;
            };
            node.last_access = Utc::now();
            node.access_count += 1;
        }
        self.check_pressure();
        true
    }

    /// Unload a component, returning the bytes reclaimed.
    ///
    /// Unloading an already-unloaded component reclaims nothing. Fails with
    /// [`ResidencyError::DependencyViolation`] while a loaded or reloading
    /// component depends on it.
    pub fn try_unload(&self, name: &str) -> Result<u64> {
        let (size_bytes, checkpoint) = {
            let mut graph = lock(&self.graph);
            let node = graph
                .get(name)
                .ok_or_else(|| ResidencyError::NotFound(format!("component {}", name)))?;
            if node.busy {
                return Err(ResidencyError::InvalidState(format!(
                    "component {} is mid-transition",
                    name
                )));
            }
            if !node.is_loaded {
                return Ok(0);
            }

            let mut dependents: Vec<String> = dependents_of(&graph, name)
                .filter(|(_, dependent)| is_live(dependent))
                .map(|(dependent, _)| dependent.clone())
                .collect();
            if !dependents.is_empty() {
                dependents.sort();
                return Err(ResidencyError::DependencyViolation {
                    component: name.to_string(),
                    dependents,
                });
            }

            let node = graph
                .get_mut(name)
                .ok_or_else(|| ResidencyError::NotFound(format!("component {}", name)))?;
            node.busy = true;
            (node.size_bytes, node.checkpoint_location.clone())
        };

        if let Err(e) = self.checkpoint(name, checkpoint.as_deref()) {
            if let Some(node) = lock(&self.graph).get_mut(name) {
                node.busy = false;
            }
            return Err(e);
        }
        if let Some(host) = &self.host {
            host.release(name);
        }

        if let Some(node) = lock(&self.graph).get_mut(name) {
            node.is_loaded = false;
            node.busy = false;
        }
        info!(component = %name, bytes = size_bytes, "Unloaded component");
        Ok(size_bytes)
    }

    fn checkpoint(&self, name: &str, location: Option<&str>) -> Result<()> {
        let (Some(location), Some(storage), Some(host)) = (location, &self.storage, &self.host) else {
            return Ok(());
        };
        let bytes = host.snapshot(name)?;
        storage.put(location, &bytes)?;
        debug!(component = %name, location = %location, bytes = bytes.len(), "Checkpointed component");
        Ok(())
    }

    /// Unload, logging instead of failing. Returns whether the component is
    /// now unloaded.
    pub fn unload(&self, name: &str) -> bool {
        match self.try_unload(name) {
            Ok(_) => true,
            Err(e) => {
                warn!(component = %name, "Unload refused: {}", e);
                false
            }
        }
    }

    /// Reload a component and, first, every unloaded dependency.
    ///
    /// Fails fast on the first dependency that cannot be restored. Returns
    /// the bytes brought back.
    pub fn try_reload(&self, name: &str) -> Result<u64> {
        let order = self.load_order(&[name])?;
        let mut restored = 0;
        for component in order {
            restored += self.reload_one(&component)?;
        }
        Ok(restored)
    }

    fn reload_one(&self, name: &str) -> Result<u64> {
        let (size_bytes, checkpoint) = {
            let mut graph = lock(&self.graph);
            let node = graph
                .get(name)
                .ok_or_else(|| ResidencyError::NotFound(format!("component {}", name)))?;
            if node.is_loaded && !node.busy {
                return Ok(0);
            }
            if node.busy {
                return Err(ResidencyError::InvalidState(format!(
                    "component {} is mid-transition",
                    name
                )));
            }
            if let Some(dependency) = node.dependencies.iter().find(|d| {
                graph
                    .get(d.as_str())
                    .map(|dep| !dep.is_loaded || dep.busy)
                    .unwrap_or(true)
            }) {
                return Err(ResidencyError::InvalidState(format!(
                    "dependency {} of {} is not loaded",
                    dependency, name
                )));
            }

            let node = graph
                .get_mut(name)
                .ok_or_else(|| ResidencyError::NotFound(format!("component {}", name)))?;
            node.busy = true;
            (node.size_bytes, node.checkpoint_location.clone())
        };

        let restored = self.restore(name, checkpoint.as_deref());

        let mut graph = lock(&self.graph);
        if let Some(node) = graph.get_mut(name) {
            node.busy = false;
            if restored.is_ok() {
                node.is_loaded = true;
                node.last_access = Utc::now();
            }
        }
        drop(graph);

        restored?;
        info!(component = %name, bytes = size_bytes, "Reloaded component");
        Ok(size_bytes)
    }

    fn restore(&self, name: &str, location: Option<&str>) -> Result<()> {
        let Some(host) = &self.host else {
            return Ok(());
        };
        let checkpoint = match (location, &self.storage) {
            (Some(location), Some(storage)) => {
                let bytes = storage.get(location)?;
                if bytes.is_none() {
                    warn!(component = %name, location = %location, "Checkpoint missing; restoring from scratch");
                }
                bytes
            }
            _ => None,
        };
        host.restore(name, checkpoint.as_deref())
    }

    /// Reload, logging instead of failing.
    pub fn reload(&self, name: &str) -> bool {
        match self.try_reload(name) {
            Ok(_) => true,
            Err(e) => {
                warn!(component = %name, "Reload failed: {}", e);
                false
            }
        }
    }

    /// The `count` lowest-priority loaded components.
    ///
    /// Skips components whose dependents are being reloaded.
    pub fn candidates(&self, count: usize) -> Vec<UnloadCandidate> {
        let graph = lock(&self.graph);
        let now = Utc::now();
        let mut candidates: Vec<UnloadCandidate> = graph
            .iter()
            .filter(|(name, node)| {
                node.is_loaded
                    && !node.busy
                    && !dependents_of(&graph, name).any(|(_, dependent)| dependent.busy && !dependent.is_loaded)
            })
            .map(|(name, node)| UnloadCandidate {
                name: name.clone(),
                size_bytes: node.size_bytes,
                priority: priority(node, dependents_of(&graph, name).count(), now, &self.settings.weights),
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .total_cmp(&b.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        candidates.truncate(count);
        candidates
    }

    pub fn status(&self, name: &str) -> Option<ComponentStatus> {
        let graph = lock(&self.graph);
        let node = graph.get(name)?;
        let mut dependents: Vec<String> = dependents_of(&graph, name).map(|(n, _)| n.clone()).collect();
        dependents.sort();
        Some(ComponentStatus {
            name: name.to_string(),
            kind: node.kind,
            size_bytes: node.size_bytes,
            is_loaded: node.is_loaded,
            dependencies: node.dependencies.clone(),
            priority: priority(node, dependents.len(), Utc::now(), &self.settings.weights),
            dependents,
            access_count: node.access_count,
            last_access: node.last_access,
            checkpoint_location: node.checkpoint_location.clone(),
        })
    }

    /// Dependency-first order covering `targets` and everything they depend
    /// on. An empty `targets` orders the whole graph.
    pub fn load_order(&self, targets: &[&str]) -> Result<Vec<String>> {
        let graph = lock(&self.graph);
        let mut roots: Vec<String> = if targets.is_empty() {
            graph.keys().cloned().collect()
        } else {
            targets.iter().map(|t| t.to_string()).collect()
        };
        if targets.is_empty() {
            roots.sort();
        }

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        for root in roots {
            // Iterative post-order walk; the graph is acyclic by construction.
            let mut stack = vec![(root, false)];
            while let Some((name, expanded)) = stack.pop() {
                if expanded {
                    order.push(name);
                    continue;
                }
                if visited.contains(&name) {
                    continue;
                }
                let node = graph
                    .get(&name)
                    .ok_or_else(|| ResidencyError::NotFound(format!("component {}", name)))?;
                visited.insert(name.clone());
                stack.push((name, true));
                for dependency in node.dependencies.iter().rev() {
                    if !visited.contains(dependency) {
                        stack.push((dependency.clone(), false));
                    }
                }
            }
        }
        Ok(order)
    }

    /// Total bytes of loaded components.
    pub fn loaded_bytes(&self) -> u64 {
        lock(&self.graph)
            .values()
            .filter(|node| node.is_loaded)
            .map(|node| node.size_bytes)
            .sum()
    }

    /// Unload the lowest-priority components if system memory is above the
    /// pressure threshold.
    ///
    /// Returns `None` when below the threshold, when the memory sample is
    /// unavailable, or when another check is already running.
    pub fn check_pressure(&self) -> Option<PressureReport> {
        if self.checking_pressure.swap(true, Ordering::AcqRel) {
            return None;
        }
        let report = self.relieve_pressure();
        self.checking_pressure.store(false, Ordering::Release);
        report
    }

    fn relieve_pressure(&self) -> Option<PressureReport> {
        let sample = self.monitor.sample()?;
        let fraction = sample.system_usage_fraction();
        if fraction < self.settings.pressure_threshold {
            return None;
        }

        let mut report = PressureReport {
            system_usage_fraction: fraction,
            ..PressureReport::default()
        };
        for candidate in self.candidates(self.settings.pressure_batch) {
            match self.try_unload(&candidate.name) {
                Ok(bytes) => {
                    report.bytes_reclaimed += bytes;
                    report.unloaded.push(candidate.name);
                }
                Err(e) => {
                    debug!(component = %candidate.name, "Pressure unload rejected: {}", e);
                    report.rejected.push(candidate.name);
                }
            }
        }
        if !report.unloaded.is_empty() {
            self.monitor.refresh();
            info!(
                usage = fraction,
                unloaded = report.unloaded.len(),
                bytes = report.bytes_reclaimed,
                "Unloaded components under memory pressure"
            );
        }
        Some(report)
    }
}

impl std::fmt::Debug for ComponentUnloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentUnloadManager")
            .field("settings", &self.settings)
            .field("components", &lock(&self.graph).len())
            .finish_non_exhaustive()
    }
}
