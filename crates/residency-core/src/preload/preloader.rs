//! Speculative loading driven by usage history.
//!
//! The preloader only ever asks the lifecycle manager to *queue* a preload;
//! it never waits for one. Preloads are admitted when enough of the memory
//! budget is free, and the lifecycle manager guarantees they never evict.

use super::history::{PreloadStrategy, UsageHistory};
use crate::cancel::CancellationToken;
use crate::config::PreloadSettings;
use crate::error::Result;
use crate::lifecycle::{ModelLifecycleManager, ResidencyState};
use crate::monitor::MemoryMonitor;
use crate::storage::atomic::{atomic_read_json, atomic_write_json};
use crate::sync::lock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Preloader counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreloadStats {
    pub paused: bool,
    pub recorded: u64,
    /// Preloads handed to the lifecycle manager.
    pub enqueued: u64,
    /// `preload` calls refused for lack of headroom.
    pub skipped_low_headroom: u64,
    pub tracked_artifacts: usize,
    pub sequence_len: usize,
    pub scheduled: usize,
}

#[derive(Default)]
struct Counters {
    recorded: AtomicU64,
    enqueued: AtomicU64,
    skipped_low_headroom: AtomicU64,
}

/// Predicts upcoming loads and warms them in the background.
pub struct Preloader {
    settings: PreloadSettings,
    monitor: Arc<MemoryMonitor>,
    lifecycle: ModelLifecycleManager,
    history: Mutex<UsageHistory>,
    paused: AtomicBool,
    counters: Counters,
}

impl Preloader {
    pub fn new(settings: PreloadSettings, monitor: Arc<MemoryMonitor>, lifecycle: ModelLifecycleManager) -> Self {
        Self {
            settings,
            monitor,
            lifecycle,
            history: Mutex::new(UsageHistory::default()),
            paused: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn settings(&self) -> &PreloadSettings {
        &self.settings
    }

    /// Note that `name` was just used.
    pub fn record_usage(&self, name: &str) {
        self.record_usage_at(name, Utc::now());
    }

    pub fn record_usage_at(&self, name: &str, at: DateTime<Utc>) {
        lock(&self.history).record(name, at, self.settings.history_limit);
        self.counters.recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Expect `name` to be needed at `at`.
    pub fn schedule(&self, name: &str, at: DateTime<Utc>) {
        lock(&self.history).schedule(name, at);
        debug!(model = %name, %at, "Scheduled load");
    }

    /// Up to `limit` predicted artifacts that are not already resident or
    /// loading, best first.
    pub fn predict(&self, strategy: PreloadStrategy, limit: usize) -> Vec<String> {
        let now = Utc::now();
        let horizon = self.settings.schedule_horizon();
        let ranked = {
            let mut history = lock(&self.history);
            history.prune_schedule(now, horizon);
            history.predict(strategy, self.settings.ngram_order, now, horizon)
        };
        ranked
            .into_iter()
            .filter(|name| self.lifecycle.state(name) == ResidencyState::Absent)
            .take(limit)
            .collect()
    }

    /// Queue background loads of `names`.
    ///
    /// Refused entirely when paused or when less than the configured fraction
    /// of the memory budget is free. Returns the names actually queued.
    pub fn preload<S: AsRef<str>>(&self, names: &[S]) -> Vec<String> {
        if names.is_empty() {
            return Vec::new();
        }
        if self.is_paused() {
            debug!("Preloader paused; ignoring preload request");
            return Vec::new();
        }
        let headroom = self.monitor.headroom_fraction();
        if headroom < self.settings.headroom_fraction {
            self.counters
                .skipped_low_headroom
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                headroom,
                required = self.settings.headroom_fraction,
                "Not enough headroom to preload"
            );
            return Vec::new();
        }

        let mut queued = Vec::new();
        for name in names {
            let name = name.as_ref();
            if self.lifecycle.enqueue_preload(name) {
                queued.push(name.to_string());
            }
        }
        self.counters
            .enqueued
            .fetch_add(queued.len() as u64, Ordering::Relaxed);
        if !queued.is_empty() {
            info!(models = ?queued, "Queued preloads");
        }
        queued
    }

    /// Predict with the adaptive strategy and preload the result.
    pub fn run_once(&self) -> Vec<String> {
        let predicted = self.predict(PreloadStrategy::Adaptive, self.settings.max_predictions);
        self.preload(&predicted)
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!("Preloader paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("Preloader resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Persist usage history as JSON.
    pub fn save_history(&self, path: &Path) -> Result<()> {
        let snapshot = lock(&self.history).clone();
        atomic_write_json(path, &snapshot, false)
    }

    /// Replace usage history with the one stored at `path`. Returns `false`
    /// when there is no file.
    pub fn load_history(&self, path: &Path) -> Result<bool> {
        match atomic_read_json::<UsageHistory>(path)? {
            Some(history) => {
                info!(
                    path = %path.display(),
                    artifacts = history.accesses.len(),
                    "Loaded usage history"
                );
                *lock(&self.history) = history;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Save to the configured history file, if any, logging failures.
    fn persist(&self) {
        if let Some(path) = &self.settings.history_file {
            if let Err(e) = self.save_history(path) {
                warn!("Failed to save usage history: {}", e);
            }
        }
    }

    pub fn stats(&self) -> PreloadStats {
        let history = lock(&self.history);
        PreloadStats {
            paused: self.is_paused(),
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            skipped_low_headroom: self.counters.skipped_low_headroom.load(Ordering::Relaxed),
            tracked_artifacts: history.accesses.len(),
            sequence_len: history.sequence.len(),
            scheduled: history.scheduled.len(),
        }
    }

    /// Run [`Preloader::run_once`] every `interval` until `cancel` fires.
    ///
    /// History is saved to the configured file after every pass and once
    /// more on exit.
    pub fn spawn_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(?interval, "Preload loop started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if cancel.is_cancelled() {
                    break;
                }
                if !self.is_paused() {
                    self.run_once();
                }
                self.persist();
            }
            self.persist();
            info!("Preload loop stopped");
        })
    }
}

impl std::fmt::Debug for Preloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preloader")
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleSettings, MonitorSettings};
    use crate::lifecycle::{Disposable, LoadRequest, ModelConstructor, ModelHandle};
    use crate::monitor::SharedProbe;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Blob(u64);

    impl Disposable for Blob {
        fn dispose(&self) {}
    }

    impl ModelHandle for Blob {
        fn memory_footprint(&self) -> u64 {
            self.0
        }
    }

    struct BlobConstructor;

    #[async_trait]
    impl ModelConstructor for BlobConstructor {
        async fn construct(
            &self,
            _name: &str,
            _language: &str,
            _cancel: CancellationToken,
        ) -> anyhow::Result<Arc<dyn ModelHandle>> {
            Ok(Arc::new(Blob(10)))
        }
    }

    fn build(probe: SharedProbe) -> Preloader {
        let monitor = Arc::new(MemoryMonitor::new(
            probe,
            &MonitorSettings {
                memory_budget_bytes: 1000,
                sample_ttl_ms: 0,
            },
        ));
        let lifecycle = ModelLifecycleManager::new(
            LifecycleSettings {
                max_warm: 4,
                default_memory_limit_bytes: 10,
                ..LifecycleSettings::default()
            },
            Arc::clone(&monitor),
            Arc::new(BlobConstructor),
        );
        Preloader::new(PreloadSettings::default(), monitor, lifecycle)
    }

    #[tokio::test]
    async fn test_preload_requires_headroom() {
        let probe = SharedProbe::new(800, 0, 10_000);
        let preloader = build(probe.clone());

        assert!(preloader.preload(&["a"]).is_empty());
        assert_eq!(preloader.stats().skipped_low_headroom, 1);

        probe.set_process_bytes(600);
        assert_eq!(preloader.preload(&["a", "b"]), vec!["a", "b"]);
        // Already queued or loading.
        assert!(preloader.preload(&["a"]).is_empty());
        assert_eq!(preloader.stats().enqueued, 2);
    }

    #[tokio::test]
    async fn test_preload_is_non_blocking_and_lands_warm() {
        let preloader = build(SharedProbe::new(0, 0, 10_000));
        preloader.preload(&["a"]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(preloader.lifecycle.state("a"), ResidencyState::Warm);
        assert!(preloader.lifecycle.current().is_none());
    }

    #[tokio::test]
    async fn test_paused_preloader_does_nothing() {
        let preloader = build(SharedProbe::new(0, 0, 10_000));
        preloader.pause();
        assert!(preloader.preload(&["a"]).is_empty());
        assert!(preloader.stats().paused);

        preloader.resume();
        assert_eq!(preloader.preload(&["a"]), vec!["a"]);
    }

    #[tokio::test]
    async fn test_predict_skips_resident_artifacts() {
        let preloader = build(SharedProbe::new(0, 0, 10_000));
        for name in ["a", "b", "a", "b", "a"] {
            preloader.record_usage(name);
        }
        assert_eq!(preloader.predict(PreloadStrategy::Sequence, 3), vec!["b"]);

        preloader
            .lifecycle
            .try_load(LoadRequest::new("b", "en"))
            .await
            .unwrap();
        assert!(preloader.predict(PreloadStrategy::Sequence, 3).is_empty());
        assert_eq!(preloader.predict(PreloadStrategy::Frequency, 3), vec!["a"]);
    }

    #[tokio::test]
    async fn test_schedule_takes_priority() {
        let preloader = build(SharedProbe::new(0, 0, 10_000));
        for name in ["a", "b", "a", "b"] {
            preloader.record_usage(name);
        }
        preloader.schedule("nightly", Utc::now() + chrono::Duration::seconds(30));

        let predicted = preloader.predict(PreloadStrategy::Adaptive, 2);
        assert_eq!(predicted, vec!["nightly", "a"]);
        assert_eq!(preloader.run_once(), vec!["nightly", "a", "b"]);
    }

    #[test]
    fn test_history_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("usage.json");
        let preloader = build(SharedProbe::new(0, 0, 10_000));
        for name in ["a", "b", "c"] {
            preloader.record_usage(name);
        }
        preloader.save_history(&path).unwrap();

        let restored = build(SharedProbe::new(0, 0, 10_000));
        assert!(!restored.load_history(&temp_dir.path().join("missing.json")).unwrap());
        assert!(restored.load_history(&path).unwrap());
        let stats = restored.stats();
        assert_eq!(stats.tracked_artifacts, 3);
        assert_eq!(stats.sequence_len, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_cancel() {
        let preloader = Arc::new(build(SharedProbe::new(0, 0, 10_000)));
        preloader.record_usage("a");
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&preloader).spawn_loop(Duration::from_secs(30), cancel.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(preloader.lifecycle.state("a"), ResidencyState::Warm);

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.is_finished());
    }
}
