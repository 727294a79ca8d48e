//! Periodic background maintenance.
//!
//! A single worker runs the cache sweep and the component pressure check on
//! a fixed interval. Both are synchronous and may touch storage, so each pass
//! runs on the blocking pool. A failed or panicking pass is logged and the
//! worker carries on.

use crate::cache::{CacheValue, SweepReport, TieredCache};
use crate::cancel::CancellationToken;
use crate::components::{ComponentUnloadManager, PressureReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub sweep: SweepReport,
    /// `None` when below the pressure threshold or the sample was unavailable.
    pub pressure: Option<PressureReport>,
}

/// Run one pass synchronously.
pub fn run_pass<V: CacheValue>(
    cache: &TieredCache<V>,
    components: &ComponentUnloadManager,
) -> MaintenanceReport {
    let sweep = cache.sweep();
    let pressure = components.check_pressure();
    MaintenanceReport { sweep, pressure }
}

/// Handle to a running maintenance worker.
#[derive(Debug)]
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Cancellation token observed by the worker; other background loops
    /// started alongside it share the token.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }

    /// Stop the worker and wait for an in-progress pass to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wake.notify_one();
        if let Err(e) = self.worker.await {
            warn!("Maintenance worker ended abnormally: {}", e);
        }
    }
}

/// Spawn the maintenance worker on the current runtime.
pub fn spawn_maintenance<V: CacheValue>(
    cache: Arc<TieredCache<V>>,
    components: Arc<ComponentUnloadManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> MaintenanceHandle {
    let wake = Arc::new(Notify::new());
    let worker_wake = Arc::clone(&wake);
    let worker_cancel = cancel.clone();

    let worker = tokio::spawn(async move {
        info!(?interval, "Maintenance worker started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = worker_wake.notified() => {}
            }
            if worker_cancel.is_cancelled() {
                break;
            }

            let cache = Arc::clone(&cache);
            let components = Arc::clone(&components);
            match tokio::task::spawn_blocking(move || run_pass(&cache, &components)).await {
                Ok(report) => debug!(
                    demoted = report.sweep.memory_entries_evicted,
                    purged = report.sweep.secondary_entries_purged,
                    unloaded = report.pressure.as_ref().map(|p| p.unloaded.len()).unwrap_or(0),
                    "Maintenance pass finished"
                ),
                Err(e) => warn!("Maintenance pass failed: {}", e),
            }
        }
        info!("Maintenance worker stopped");
    });

    MaintenanceHandle {
        cancel,
        wake,
        worker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{ComponentKind, ComponentSpec};
    use crate::config::{CacheSettings, ComponentSettings, MonitorSettings};
    use crate::monitor::{MemoryMonitor, SharedProbe};
    use bytes::Bytes;

    fn setup(probe: SharedProbe) -> (Arc<TieredCache<Bytes>>, Arc<ComponentUnloadManager>) {
        let monitor = Arc::new(MemoryMonitor::new(
            probe,
            &MonitorSettings {
                memory_budget_bytes: 1000,
                sample_ttl_ms: 0,
            },
        ));
        let cache = Arc::new(TieredCache::new(
            CacheSettings {
                memory_budget_bytes: 1000,
                ..CacheSettings::default()
            },
            Arc::clone(&monitor),
        ));
        let components = Arc::new(ComponentUnloadManager::new(
            ComponentSettings::default(),
            monitor,
        ));
        (cache, components)
    }

    #[test]
    fn test_pass_relieves_pressure() {
        let probe = SharedProbe::new(0, 50, 100);
        let (cache, components) = setup(probe.clone());
        components
            .register(ComponentSpec::new("norm", ComponentKind::Normalization, 10))
            .unwrap();

        let quiet = run_pass(&cache, &components);
        assert!(quiet.pressure.is_none());

        probe.set_system_used_bytes(95);
        let busy = run_pass(&cache, &components);
        assert_eq!(busy.pressure.unwrap().unloaded, vec!["norm"]);
    }

    #[tokio::test]
    async fn test_worker_runs_until_shutdown() {
        let probe = SharedProbe::new(0, 95, 100);
        let (cache, components) = setup(probe);
        components
            .register(ComponentSpec::new("norm", ComponentKind::Normalization, 10))
            .unwrap();

        let handle = spawn_maintenance(
            Arc::clone(&cache),
            Arc::clone(&components),
            Duration::from_millis(20),
            CancellationToken::new(),
        );
        assert!(handle.is_running());

        for _ in 0..200 {
            if !components.status("norm").unwrap().is_loaded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!components.status("norm").unwrap().is_loaded);

        let token = handle.token();
        handle.shutdown().await;
        assert!(token.is_cancelled());
    }
}
