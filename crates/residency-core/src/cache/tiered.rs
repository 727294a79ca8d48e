//! Two-tier LRU cache: a byte-bounded memory tier backed by a durable
//! secondary tier.
//!
//! Lock order is always memory tier before secondary index. Slow work
//! (encoding, storage reads/writes, blob deletes) runs with neither held.
//! Puts that must evict are serialized through an eviction gate so that
//! "evict, then insert" is atomic with respect to other writers; entries being
//! demoted stay readable and keep their bytes counted until the demotion
//! completes or is abandoned.

use super::index::{IndexLine, IndexLog, IndexRecord, RecoveryReport, SecondaryIndex};
use super::lru::LruTier;
use super::types::{CacheStats, CacheValue, SweepReport, Tier};
use crate::checksum::Checksum;
use crate::config::CacheSettings;
use crate::error::{ResidencyError, Result};
use crate::monitor::MemoryMonitor;
use crate::storage::StorageBackend;
use crate::sync::lock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
struct Demoting<V> {
    value: V,
    size_bytes: u64,
    token: u64,
}

#[derive(Debug)]
struct MemoryTier<V> {
    lru: LruTier<V>,
    demoting: HashMap<String, Demoting<V>>,
    demoting_bytes: u64,
    next_token: u64,
}

impl<V> MemoryTier<V> {
    fn fits(&self, size: u64) -> bool {
        self.lru.fits(size, self.demoting_bytes)
    }

    fn occupied_bytes(&self) -> u64 {
        self.lru.current_bytes() + self.demoting_bytes
    }

    fn begin_demotion(&mut self, key: String, value: V, size_bytes: u64) -> PendingDemotion<V>
    where
        V: Clone,
    {
        let token = self.next_token;
        self.next_token += 1;
        self.demoting_bytes += size_bytes;
        self.demoting.insert(
            key.clone(),
            Demoting {
                value: value.clone(),
                size_bytes,
                token,
            },
        );
        PendingDemotion {
            key,
            value,
            size_bytes,
            token,
        }
    }

    /// Forget an in-flight demotion; its blob is discarded when it lands.
    fn cancel_demotion(&mut self, key: &str) {
        if let Some(pending) = self.demoting.remove(key) {
            self.demoting_bytes = self.demoting_bytes.saturating_sub(pending.size_bytes);
        }
    }

    /// Finish a demotion if it is still the current one for `key`.
    fn complete_demotion(&mut self, key: &str, token: u64) -> bool {
        match self.demoting.get(key) {
            Some(pending) if pending.token == token => {
                self.cancel_demotion(key);
                true
            }
            _ => false,
        }
    }

    fn forget(&mut self, key: &str) -> bool {
        let in_lru = self.lru.remove(key).is_some();
        let in_flight = self.demoting.contains_key(key);
        self.cancel_demotion(key);
        in_lru || in_flight
    }
}

struct PendingDemotion<V> {
    key: String,
    value: V,
    size_bytes: u64,
    token: u64,
}

struct SecondaryTier {
    storage: Arc<dyn StorageBackend>,
    index: Mutex<SecondaryIndex>,
    log: IndexLog,
}

/// Outcome of admitting a record to the secondary index.
#[derive(Default)]
struct Admission {
    lines: Vec<IndexLine>,
    /// Records whose blobs must be deleted.
    displaced: Vec<IndexRecord>,
    evicted: u64,
}

fn admit(index: &mut SecondaryIndex, key: &str, location: &str, size_bytes: u64) -> Admission {
    let mut admission = Admission::default();
    if let Some((record, line)) = index.remove(key) {
        admission.displaced.push(record);
        admission.lines.push(line);
    }
    for (record, line) in index.evict_for(size_bytes) {
        debug!(key = %record.key, bytes = record.size_bytes, "Evicting secondary cache entry");
        admission.displaced.push(record);
        admission.lines.push(line);
        admission.evicted += 1;
    }
    let (lines, _) = index.put(key, location, size_bytes);
    admission.lines.extend(lines);
    admission
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    secondary_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    storage_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Generic key → value cache with memory and secondary tiers.
pub struct TieredCache<V: CacheValue> {
    settings: CacheSettings,
    monitor: Arc<MemoryMonitor>,
    memory: Mutex<MemoryTier<V>>,
    eviction_gate: Mutex<()>,
    secondary: Option<SecondaryTier>,
    recovery: Option<RecoveryReport>,
    counters: Counters,
}

impl<V: CacheValue> TieredCache<V> {
    /// Create a memory-only cache. Evicted entries are dropped.
    pub fn new(settings: CacheSettings, monitor: Arc<MemoryMonitor>) -> Self {
        let memory = MemoryTier {
            lru: LruTier::new(settings.memory_budget_bytes, None),
            demoting: HashMap::new(),
            demoting_bytes: 0,
            next_token: 0,
        };
        Self {
            settings,
            monitor,
            memory: Mutex::new(memory),
            eviction_gate: Mutex::new(()),
            secondary: None,
            recovery: None,
            counters: Counters::default(),
        }
    }

    /// Create a cache with a durable secondary tier.
    ///
    /// If `index_path` is given the secondary index is rebuilt from it and
    /// compacted; records whose blobs are missing are dropped.
    pub fn with_storage(
        settings: CacheSettings,
        monitor: Arc<MemoryMonitor>,
        storage: Arc<dyn StorageBackend>,
        index_path: Option<PathBuf>,
    ) -> Result<Self> {
        let log = IndexLog::new(index_path, settings.index_compact_threshold);
        let (index, report) = log.recover(storage.as_ref(), settings.secondary_budget_bytes)?;
        let index = Mutex::new(index);
        if log.is_persistent() {
            log.compact(&index)?;
        }

        info!(
            storage = %storage.describe(),
            recovered = report.recovered,
            "Opened tiered cache"
        );

        let mut cache = Self::new(settings, monitor);
        cache.secondary = Some(SecondaryTier {
            storage,
            index,
            log,
        });
        cache.recovery = Some(report);
        Ok(cache)
    }

    /// What index recovery found at startup, if a secondary tier exists.
    pub fn recovery(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    fn memory_budget(&self) -> u64 {
        lock(&self.memory).lru.budget_bytes()
    }

    fn promotion_limit(&self) -> u64 {
        (self.memory_budget() as f64 * self.settings.promotion_fraction) as u64
    }

    fn admission_limit(&self) -> u64 {
        (self.memory_budget() as f64 * self.settings.memory_admission_fraction) as u64
    }

    fn demotes(&self) -> bool {
        self.settings.persistence_enabled && self.secondary.is_some()
    }

    /// Look up a value, memory tier first.
    ///
    /// A secondary hit is promoted into memory when it is small enough and
    /// the monitor reports room for it.
    pub fn get(&self, key: &str) -> Result<Option<V>> {
        {
            let mut memory = lock(&self.memory);
            if let Some(entry) = memory.lru.touch(key) {
                let value = entry.value.clone();
                bump(&self.counters.memory_hits);
                return Ok(Some(value));
            }
            if let Some(pending) = memory.demoting.get(key) {
                let value = pending.value.clone();
                bump(&self.counters.memory_hits);
                return Ok(Some(value));
            }
        }

        let Some(secondary) = &self.secondary else {
            bump(&self.counters.misses);
            return Ok(None);
        };

        let touched = lock(&secondary.index).touch(key);
        let Some((record, line)) = touched else {
            bump(&self.counters.misses);
            return Ok(None);
        };
        self.append_index(secondary, &[line]);

        let bytes = match secondary.storage.get(&record.location) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(key = %key, location = %record.location, "Secondary cache blob missing; dropping record");
                self.drop_secondary_record(secondary, key, &record.location);
                bump(&self.counters.misses);
                return Ok(None);
            }
            Err(e) => {
                bump(&self.counters.storage_failures);
                return Err(e);
            }
        };
        let value = V::decode(&bytes)?;
        bump(&self.counters.secondary_hits);

        if record.size_bytes <= self.promotion_limit() && self.monitor.has_room(record.size_bytes) {
            self.promote(secondary, &record, &value);
        }
        Ok(Some(value))
    }

    fn promote(&self, secondary: &SecondaryTier, record: &IndexRecord, value: &V) {
        let removed = {
            let mut memory = lock(&self.memory);
            if memory.lru.contains(&record.key) || memory.demoting.contains_key(&record.key) {
                return;
            }
            if !memory.fits(record.size_bytes) {
                debug!(key = %record.key, "No memory tier space for promotion");
                return;
            }
            memory
                .lru
                .insert(record.key.clone(), value.clone(), record.size_bytes);

            let removed = lock(&secondary.index).remove_if_location(&record.key, &record.location);
            if removed.is_none() {
                // The secondary record was replaced while we were reading it.
                memory.lru.remove(&record.key);
            }
            removed
        };

        if let Some((_, line)) = removed {
            self.append_index(secondary, &[line]);
            self.delete_blob(secondary, &record.location);
            bump(&self.counters.promotions);
            debug!(key = %record.key, bytes = record.size_bytes, "Promoted cache entry to memory");
        }
    }

    /// Insert a value. `size_bytes` defaults to the value's own estimate.
    ///
    /// Returns the tier the value landed in.
    pub fn put(&self, key: &str, value: V, size_bytes: Option<u64>) -> Result<Tier> {
        let size = size_bytes.unwrap_or_else(|| value.estimated_size());
        if size > self.admission_limit() {
            debug!(key = %key, bytes = size, "Entry too large for memory tier; writing to secondary");
            self.put_secondary(key, value, size)?;
            return Ok(Tier::Secondary);
        }

        let _gate = lock(&self.eviction_gate);
        loop {
            let victims = {
                let mut memory = lock(&self.memory);
                memory.forget(key);
                if memory.fits(size) {
                    memory.lru.insert(key.to_string(), value, size);
                    break;
                }

                let mut victims = Vec::new();
                while !memory.fits(size) {
                    let Some(entry) = memory.lru.pop_lru() else {
                        break;
                    };
                    victims.push(memory.begin_demotion(entry.key, entry.value, entry.size_bytes));
                }
                if victims.is_empty() {
                    let available = memory.lru.budget_bytes().saturating_sub(memory.occupied_bytes());
                    return Err(ResidencyError::ResourceExhausted {
                        required: size,
                        available,
                    });
                }
                victims
            };
            for victim in victims {
                self.finish_demotion(victim);
            }
        }

        if let Some(secondary) = &self.secondary {
            let removed = lock(&secondary.index).remove(key);
            if let Some((record, line)) = removed {
                self.append_index(secondary, &[line]);
                self.delete_blob(secondary, &record.location);
            }
        }
        Ok(Tier::Memory)
    }

    fn put_secondary(&self, key: &str, value: V, size: u64) -> Result<()> {
        let Some(secondary) = &self.secondary else {
            return Err(ResidencyError::ResourceExhausted {
                required: size,
                available: self.admission_limit(),
            });
        };
        if size > self.settings.secondary_budget_bytes {
            return Err(ResidencyError::ResourceExhausted {
                required: size,
                available: self.settings.secondary_budget_bytes,
            });
        }

        let bytes = value.encode()?;
        let location = blob_location(key);
        if let Err(e) = secondary.storage.put(&location, &bytes) {
            bump(&self.counters.storage_failures);
            return Err(e);
        }

        let admission = admit(&mut lock(&secondary.index), key, &location, size);
        lock(&self.memory).forget(key);
        self.apply_admission(secondary, admission);
        Ok(())
    }

    fn finish_demotion(&self, victim: PendingDemotion<V>) {
        bump(&self.counters.evictions);
        let secondary = match &self.secondary {
            Some(secondary) if self.demotes() => secondary,
            _ => {
                lock(&self.memory).complete_demotion(&victim.key, victim.token);
                debug!(key = %victim.key, bytes = victim.size_bytes, "Evicted memory cache entry");
                return;
            }
        };

        let written = self.write_demoted(secondary, &victim);
        let mut memory = lock(&self.memory);
        let current = memory.complete_demotion(&victim.key, victim.token);
        let Some(location) = written else {
            return;
        };
        if !current {
            drop(memory);
            debug!(key = %victim.key, "Demotion superseded; discarding blob");
            self.delete_blob(secondary, &location);
            return;
        }
        let admission = admit(
            &mut lock(&secondary.index),
            &victim.key,
            &location,
            victim.size_bytes,
        );
        drop(memory);

        bump(&self.counters.demotions);
        debug!(key = %victim.key, bytes = victim.size_bytes, "Demoted cache entry to secondary");
        self.apply_admission(secondary, admission);
    }

    /// Encode and store a victim, returning its location. Failures degrade to
    /// dropping the entry.
    fn write_demoted(&self, secondary: &SecondaryTier, victim: &PendingDemotion<V>) -> Option<String> {
        if victim.size_bytes > self.settings.secondary_budget_bytes {
            debug!(key = %victim.key, "Entry exceeds secondary budget; dropping");
            return None;
        }
        let written = victim.value.encode().and_then(|bytes| {
            let location = blob_location(&victim.key);
            secondary.storage.put(&location, &bytes).map(|_| location)
        });
        match written {
            Ok(location) => Some(location),
            Err(e) => {
                bump(&self.counters.storage_failures);
                warn!(key = %victim.key, "Failed to demote cache entry, dropping it: {}", e);
                None
            }
        }
    }

    fn apply_admission(&self, secondary: &SecondaryTier, admission: Admission) {
        self.counters
            .evictions
            .fetch_add(admission.evicted, Ordering::Relaxed);
        self.append_index(secondary, &admission.lines);
        for record in &admission.displaced {
            self.delete_blob(secondary, &record.location);
        }
        if let Err(e) = secondary.log.maybe_compact(&secondary.index) {
            warn!("Cache index compaction failed: {}", e);
        }
    }

    fn append_index(&self, secondary: &SecondaryTier, lines: &[IndexLine]) {
        if let Err(e) = secondary.log.append(lines) {
            bump(&self.counters.storage_failures);
            warn!("Failed to append cache index record: {}", e);
        }
    }

    fn delete_blob(&self, secondary: &SecondaryTier, location: &str) {
        if let Err(e) = secondary.storage.delete(location) {
            bump(&self.counters.storage_failures);
            warn!(location = %location, "Failed to delete cache blob: {}", e);
        }
    }

    fn drop_secondary_record(&self, secondary: &SecondaryTier, key: &str, location: &str) {
        let removed = lock(&secondary.index).remove_if_location(key, location);
        if let Some((_, line)) = removed {
            self.append_index(secondary, &[line]);
        }
    }

    /// Remove a key from both tiers. Returns whether anything was removed.
    pub fn remove(&self, key: &str) -> bool {
        let in_memory = lock(&self.memory).forget(key);
        let mut in_secondary = false;
        if let Some(secondary) = &self.secondary {
            let removed = lock(&secondary.index).remove(key);
            if let Some((record, line)) = removed {
                self.append_index(secondary, &[line]);
                self.delete_blob(secondary, &record.location);
                in_secondary = true;
            }
        }
        in_memory || in_secondary
    }

    /// Drop every entry and delete all secondary blobs.
    pub fn clear(&self) {
        let dropped = {
            let mut memory = lock(&self.memory);
            let dropped = memory.lru.drain().len() + memory.demoting.len();
            memory.demoting.clear();
            memory.demoting_bytes = 0;
            dropped
        };

        let mut purged = 0;
        if let Some(secondary) = &self.secondary {
            let records = lock(&secondary.index).drain();
            purged = records.len();
            for record in &records {
                self.delete_blob(secondary, &record.location);
            }
            if let Err(e) = secondary.log.compact(&secondary.index) {
                warn!("Failed to rewrite cache index after clear: {}", e);
            }
        }
        info!(memory = dropped, secondary = purged, "Cleared tiered cache");
    }

    /// Move an entry from memory to the secondary tier.
    ///
    /// Returns `Ok(false)` if the key is not in the memory tier, which makes
    /// repeated demotion a no-op. Without a secondary tier the entry is
    /// evicted.
    pub fn demote(&self, key: &str) -> Result<bool> {
        let _gate = lock(&self.eviction_gate);
        let pending = {
            let mut memory = lock(&self.memory);
            let Some(entry) = memory.lru.remove(key) else {
                return Ok(false);
            };
            memory.begin_demotion(entry.key, entry.value, entry.size_bytes)
        };
        self.finish_demotion(pending);
        Ok(true)
    }

    /// Tier currently holding `key`, without touching recency.
    pub fn tier_of(&self, key: &str) -> Option<Tier> {
        {
            let memory = lock(&self.memory);
            if memory.lru.contains(key) || memory.demoting.contains_key(key) {
                return Some(Tier::Memory);
            }
        }
        let secondary = self.secondary.as_ref()?;
        lock(&secondary.index)
            .tier
            .contains(key)
            .then_some(Tier::Secondary)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tier_of(key).is_some()
    }

    /// All keys, memory tier first, each tier from least to most recently
    /// used.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = lock(&self.memory).lru.keys_lru_order();
        if let Some(secondary) = &self.secondary {
            keys.extend(lock(&secondary.index).tier.keys_lru_order());
        }
        keys
    }

    /// Change the memory tier budget, demoting entries if it shrank.
    pub fn resize_memory_budget(&self, budget_bytes: u64) {
        let _gate = lock(&self.eviction_gate);
        let victims = {
            let mut memory = lock(&self.memory);
            memory.lru.set_budget_bytes(budget_bytes);
            let mut victims = Vec::new();
            while memory.occupied_bytes() > budget_bytes {
                let Some(entry) = memory.lru.pop_lru() else {
                    break;
                };
                victims.push(memory.begin_demotion(entry.key, entry.value, entry.size_bytes));
            }
            victims
        };
        info!(budget = budget_bytes, demoting = victims.len(), "Resized memory cache tier");
        for victim in victims {
            self.finish_demotion(victim);
        }
    }

    /// One background maintenance pass.
    ///
    /// Under system memory pressure above the high-water mark, demotes memory
    /// tier entries until the estimated usage reaches the low-water mark.
    /// When the secondary tier is nearly full, purges entries unused for
    /// longer than the retention window.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.monitor.refresh();

        match self.monitor.sample() {
            Some(sample) => {
                let fraction = sample.system_usage_fraction();
                report.system_usage_fraction = fraction;
                if fraction > self.settings.high_water_fraction {
                    let excess = fraction - self.settings.low_water_fraction;
                    let target = (excess * sample.system_total_bytes as f64) as u64;
                    self.relieve_memory(target, &mut report);
                }
            }
            None => warn!("Memory sample unavailable; skipping memory pressure sweep"),
        }

        self.purge_stale(Utc::now(), &mut report);

        if !report.is_noop() {
            self.monitor.refresh();
            info!(
                memory_evicted = report.memory_entries_evicted,
                memory_bytes = report.memory_bytes_freed,
                secondary_purged = report.secondary_entries_purged,
                secondary_bytes = report.secondary_bytes_freed,
                "Cache sweep finished"
            );
        }
        report
    }

    fn relieve_memory(&self, target_bytes: u64, report: &mut SweepReport) {
        let _gate = lock(&self.eviction_gate);
        let victims = {
            let mut memory = lock(&self.memory);
            let mut victims = Vec::new();
            let mut freed = 0u64;
            while freed < target_bytes {
                let Some(entry) = memory.lru.pop_lru() else {
                    break;
                };
                freed += entry.size_bytes;
                victims.push(memory.begin_demotion(entry.key, entry.value, entry.size_bytes));
            }
            victims
        };
        for victim in victims {
            report.memory_entries_evicted += 1;
            report.memory_bytes_freed += victim.size_bytes;
            self.finish_demotion(victim);
        }
    }

    fn purge_stale(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let Some(secondary) = &self.secondary else {
            return;
        };
        let threshold =
            (self.settings.secondary_budget_bytes as f64 * self.settings.secondary_purge_fraction) as u64;
        let retention = chrono::Duration::from_std(self.settings.retention())
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let removed: Vec<(IndexRecord, IndexLine)> = {
            let mut index = lock(&secondary.index);
            if index.tier.current_bytes() <= threshold {
                return;
            }
            index
                .stale_keys(cutoff)
                .iter()
                .filter_map(|key| index.remove(key))
                .collect()
        };

        let lines: Vec<IndexLine> = removed.iter().map(|(_, line)| line.clone()).collect();
        self.append_index(secondary, &lines);
        for (record, _) in &removed {
            self.delete_blob(secondary, &record.location);
            report.secondary_entries_purged += 1;
            report.secondary_bytes_freed += record.size_bytes;
        }
    }

    /// Counters plus current tier sizes.
    pub fn stats(&self) -> CacheStats {
        let (memory_entries, memory_tier_bytes, memory_budget_bytes) = {
            let memory = lock(&self.memory);
            (
                memory.lru.len() + memory.demoting.len(),
                memory.occupied_bytes(),
                memory.lru.budget_bytes(),
            )
        };
        let (secondary_entries, secondary_tier_bytes) = match &self.secondary {
            Some(secondary) => {
                let index = lock(&secondary.index);
                (index.tier.len(), index.tier.current_bytes())
            }
            None => (0, 0),
        };

        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            secondary_hits: self.counters.secondary_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            demotions: self.counters.demotions.load(Ordering::Relaxed),
            storage_failures: self.counters.storage_failures.load(Ordering::Relaxed),
            memory_entries,
            memory_tier_bytes,
            memory_budget_bytes,
            secondary_entries,
            secondary_tier_bytes,
            secondary_budget_bytes: if self.secondary.is_some() {
                self.settings.secondary_budget_bytes
            } else {
                0
            },
        }
    }
}

impl<V: CacheValue> std::fmt::Debug for TieredCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("settings", &self.settings)
            .field("has_secondary", &self.secondary.is_some())
            .finish_non_exhaustive()
    }
}

/// Storage location for a new blob of `key`. Unique per write so that a
/// late demotion can never clobber a newer blob for the same key.
fn blob_location(key: &str) -> String {
    let digest = Checksum::sha256(key.as_bytes());
    format!("cache/{}-{}.bin", &digest.hex[..16], Uuid::new_v4().simple())
}
