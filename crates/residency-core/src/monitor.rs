//! Process and system memory monitoring.
//!
//! [`MemoryMonitor`] answers "are N bytes available under the budget?" on every
//! cache mutation, so samples are cached in atomics for a short TTL and reads
//! never take a lock. When the OS query fails the monitor reports zero
//! availability, steering callers onto the evict-first path.

use crate::config::MonitorSettings;
use crate::error::{ResidencyError, Result};
use crate::sync::lock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

/// One reading of process and system memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    /// Resident memory of this process.
    pub process_bytes: u64,
    /// Memory in use system-wide.
    pub system_used_bytes: u64,
    /// Total physical memory.
    pub system_total_bytes: u64,
}

impl MemorySample {
    /// System-wide usage in 0.0..=1.0.
    pub fn system_usage_fraction(&self) -> f64 {
        if self.system_total_bytes == 0 {
            return 1.0;
        }
        (self.system_used_bytes as f64 / self.system_total_bytes as f64).min(1.0)
    }
}

/// Source of memory readings.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Result<MemorySample>;
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for Arc<P> {
    fn sample(&self) -> Result<MemorySample> {
        (**self).sample()
    }
}

/// Probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot determine current pid, process memory unavailable: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&self) -> Result<MemorySample> {
        let pid = self
            .pid
            .ok_or_else(|| ResidencyError::Other("current pid unavailable".to_string()))?;

        let mut system = lock(&self.system);
        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        let process = system
            .process(pid)
            .ok_or_else(|| ResidencyError::Other(format!("process {} not visible", pid)))?;

        Ok(MemorySample {
            process_bytes: process.memory(),
            system_used_bytes: system.used_memory(),
            system_total_bytes: system.total_memory(),
        })
    }
}

/// Probe returning a fixed reading.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub MemorySample);

impl MemoryProbe for StaticProbe {
    fn sample(&self) -> Result<MemorySample> {
        Ok(self.0)
    }
}

/// Adjustable probe whose readings are driven by the owner, e.g. a test
/// constructor that adds its footprint on construct and subtracts on dispose.
#[derive(Debug, Clone, Default)]
pub struct SharedProbe {
    process_bytes: Arc<AtomicU64>,
    system_used_bytes: Arc<AtomicU64>,
    system_total_bytes: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
}

impl SharedProbe {
    pub fn new(process_bytes: u64, system_used_bytes: u64, system_total_bytes: u64) -> Self {
        Self {
            process_bytes: Arc::new(AtomicU64::new(process_bytes)),
            system_used_bytes: Arc::new(AtomicU64::new(system_used_bytes)),
            system_total_bytes: Arc::new(AtomicU64::new(system_total_bytes)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_process_bytes(&self, bytes: u64) {
        self.process_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn add_process_bytes(&self, bytes: u64) {
        self.process_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn sub_process_bytes(&self, bytes: u64) {
        let _ = self
            .process_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn set_system_used_bytes(&self, bytes: u64) {
        self.system_used_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Make subsequent samples fail, as an unreadable OS query would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl MemoryProbe for SharedProbe {
    fn sample(&self) -> Result<MemorySample> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ResidencyError::Other("memory probe failure".to_string()));
        }
        Ok(MemorySample {
            process_bytes: self.process_bytes.load(Ordering::SeqCst),
            system_used_bytes: self.system_used_bytes.load(Ordering::SeqCst),
            system_total_bytes: self.system_total_bytes.load(Ordering::SeqCst),
        })
    }
}

const NEVER_SAMPLED: u64 = u64::MAX;

/// Read-mostly memory monitor with a cached sample.
pub struct MemoryMonitor {
    probe: Box<dyn MemoryProbe>,
    budget: u64,
    sample_ttl: Duration,
    origin: Instant,
    /// Nanoseconds since `origin` of the last sample, or `NEVER_SAMPLED`.
    sampled_at: AtomicU64,
    sample_ok: AtomicBool,
    process_bytes: AtomicU64,
    system_used_bytes: AtomicU64,
    system_total_bytes: AtomicU64,
}

impl MemoryMonitor {
    /// Create a monitor with an explicit probe.
    pub fn new(probe: impl MemoryProbe + 'static, settings: &MonitorSettings) -> Self {
        Self {
            probe: Box::new(probe),
            budget: settings.memory_budget_bytes,
            sample_ttl: settings.sample_ttl(),
            origin: Instant::now(),
            sampled_at: AtomicU64::new(NEVER_SAMPLED),
            sample_ok: AtomicBool::new(false),
            process_bytes: AtomicU64::new(0),
            system_used_bytes: AtomicU64::new(0),
            system_total_bytes: AtomicU64::new(0),
        }
    }

    /// Create a monitor reading real process/system memory.
    pub fn system(settings: &MonitorSettings) -> Self {
        Self::new(SysinfoProbe::new(), settings)
    }

    /// Configured resident memory budget.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Latest sample, or `None` if the OS query failed.
    pub fn sample(&self) -> Option<MemorySample> {
        let now = self.origin.elapsed().as_nanos() as u64;
        let last = self.sampled_at.load(Ordering::Acquire);
        let stale = last == NEVER_SAMPLED
            || now.saturating_sub(last) >= self.sample_ttl.as_nanos() as u64;

        if stale {
            match self.probe.sample() {
                Ok(sample) => {
                    self.process_bytes.store(sample.process_bytes, Ordering::Relaxed);
                    self.system_used_bytes
                        .store(sample.system_used_bytes, Ordering::Relaxed);
                    self.system_total_bytes
                        .store(sample.system_total_bytes, Ordering::Relaxed);
                    self.sample_ok.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Memory sample failed, assuming no headroom: {}", e);
                    self.sample_ok.store(false, Ordering::Relaxed);
                }
            }
            self.sampled_at.store(now, Ordering::Release);
        }

        if !self.sample_ok.load(Ordering::Relaxed) {
            return None;
        }
        Some(MemorySample {
            process_bytes: self.process_bytes.load(Ordering::Relaxed),
            system_used_bytes: self.system_used_bytes.load(Ordering::Relaxed),
            system_total_bytes: self.system_total_bytes.load(Ordering::Relaxed),
        })
    }

    /// Drop the cached sample so the next read queries the OS.
    ///
    /// Called after evictions, whose effect should be visible immediately.
    pub fn refresh(&self) {
        self.sampled_at.store(NEVER_SAMPLED, Ordering::Release);
    }

    /// Resident bytes of this process; `u64::MAX` when unknown.
    pub fn current_usage(&self) -> u64 {
        self.sample().map(|s| s.process_bytes).unwrap_or(u64::MAX)
    }

    /// Bytes still available under `budget`.
    pub fn available(&self, budget: u64) -> u64 {
        budget.saturating_sub(self.current_usage())
    }

    /// Bytes still available under the configured budget.
    pub fn available_under_budget(&self) -> u64 {
        self.available(self.budget)
    }

    /// Whether `required` more bytes fit under the configured budget.
    pub fn has_room(&self, required: u64) -> bool {
        self.available_under_budget() >= required
    }

    /// Free fraction of the configured budget in 0.0..=1.0.
    pub fn headroom_fraction(&self) -> f64 {
        if self.budget == 0 {
            return 0.0;
        }
        self.available_under_budget() as f64 / self.budget as f64
    }

    /// System-wide memory usage; 1.0 when unknown.
    pub fn system_usage_fraction(&self) -> f64 {
        self.sample()
            .map(|s| s.system_usage_fraction())
            .unwrap_or(1.0)
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("budget", &self.budget)
            .field("sample_ttl", &self.sample_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn settings(budget: u64) -> MonitorSettings {
        MonitorSettings {
            memory_budget_bytes: budget,
            sample_ttl_ms: 0,
        }
    }

    #[test]
    fn test_available_and_has_room() {
        let monitor = MemoryMonitor::new(
            StaticProbe(MemorySample {
                process_bytes: GIB,
                system_used_bytes: 8 * GIB,
                system_total_bytes: 16 * GIB,
            }),
            &settings(4 * GIB),
        );

        assert_eq!(monitor.current_usage(), GIB);
        assert_eq!(monitor.available(4 * GIB), 3 * GIB);
        assert_eq!(monitor.available(GIB / 2), 0);
        assert!(monitor.has_room(3 * GIB));
        assert!(!monitor.has_room(3 * GIB + 1));
        assert!((monitor.system_usage_fraction() - 0.5).abs() < f64::EPSILON);
        assert!((monitor.headroom_fraction() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sampling_failure_reports_zero_availability() {
        let probe = SharedProbe::new(0, 0, 16 * GIB);
        probe.set_failing(true);
        let monitor = MemoryMonitor::new(probe.clone(), &settings(4 * GIB));

        assert_eq!(monitor.available_under_budget(), 0);
        assert!(!monitor.has_room(1));
        assert_eq!(monitor.system_usage_fraction(), 1.0);

        probe.set_failing(false);
        monitor.refresh();
        assert!(monitor.has_room(GIB));
    }

    #[test]
    fn test_sample_is_cached_until_refresh() {
        let probe = SharedProbe::new(GIB, 0, 16 * GIB);
        let monitor = MemoryMonitor::new(
            probe.clone(),
            &MonitorSettings {
                memory_budget_bytes: 4 * GIB,
                sample_ttl_ms: 60_000,
            },
        );

        assert_eq!(monitor.current_usage(), GIB);
        probe.set_process_bytes(2 * GIB);
        assert_eq!(monitor.current_usage(), GIB);

        monitor.refresh();
        assert_eq!(monitor.current_usage(), 2 * GIB);
    }

    #[test]
    fn test_sysinfo_reads_current_process() {
        let probe = SysinfoProbe::new();
        let sample = probe.sample().unwrap();
        assert!(sample.system_total_bytes > 0);
        assert!(sample.system_used_bytes <= sample.system_total_bytes);
    }
}
