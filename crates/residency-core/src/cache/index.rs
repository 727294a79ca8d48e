//! Persisted index of the secondary tier.
//!
//! The index is an append-only JSON-lines log of versioned records. Each line
//! carries a sequence number assigned under the index lock, so replay order
//! matches mutation order even when appends from different threads land out
//! of order. Corrupt, partial or unknown-version lines are dropped one by one;
//! a bad line never aborts the whole load. The log is compacted into a
//! snapshot at startup and whenever it grows past a threshold.

use super::lru::LruTier;
use crate::error::Result;
use crate::storage::atomic::{append_json_line, atomic_write_bytes, read_json_lines};
use crate::storage::StorageBackend;
use crate::sync::lock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Current on-disk record format.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// One secondary-tier entry as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub key: String,
    pub location: String,
    pub size_bytes: u64,
    pub last_access: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum IndexLine {
    Put {
        v: u32,
        seq: u64,
        record: IndexRecord,
    },
    Touch {
        v: u32,
        seq: u64,
        key: String,
        last_access: DateTime<Utc>,
    },
    Remove {
        v: u32,
        seq: u64,
        key: String,
    },
}

impl IndexLine {
    fn version(&self) -> u32 {
        match self {
            IndexLine::Put { v, .. } | IndexLine::Touch { v, .. } | IndexLine::Remove { v, .. } => *v,
        }
    }

    fn seq(&self) -> u64 {
        match self {
            IndexLine::Put { seq, .. }
            | IndexLine::Touch { seq, .. }
            | IndexLine::Remove { seq, .. } => *seq,
        }
    }
}

/// What startup recovery found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub missing_storage: usize,
    pub corrupt_lines: usize,
    pub over_budget_evicted: usize,
}

/// In-memory view of the secondary tier: key → storage location, in LRU order.
#[derive(Debug)]
pub(crate) struct SecondaryIndex {
    pub(crate) tier: LruTier<String>,
    next_seq: u64,
    appended_since_compact: usize,
}

impl SecondaryIndex {
    pub(crate) fn new(budget_bytes: u64) -> Self {
        Self {
            tier: LruTier::new(budget_bytes, None),
            next_seq: 0,
            appended_since_compact: 0,
        }
    }

    fn seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.appended_since_compact += 1;
        seq
    }

    pub(crate) fn record(&self, key: &str) -> Option<IndexRecord> {
        self.tier.peek(key).map(|entry| IndexRecord {
            key: entry.key.clone(),
            location: entry.value.clone(),
            size_bytes: entry.size_bytes,
            last_access: entry.last_access,
            created_at: entry.created_at,
        })
    }

    /// Insert a record, returning the log lines to append and the record it
    /// replaced (whose blob must be deleted).
    pub(crate) fn put(&mut self, key: &str, location: &str, size_bytes: u64) -> (Vec<IndexLine>, Option<IndexRecord>) {
        let previous = self.remove_entry(key);
        self.tier.insert(key.to_string(), location.to_string(), size_bytes);
        let record = self.record(key);
        let mut lines = Vec::new();
        if let Some(record) = record {
            lines.push(IndexLine::Put {
                v: INDEX_FORMAT_VERSION,
                seq: self.seq(),
                record,
            });
        }
        (lines, previous)
    }

    /// Mark an entry used and return its record.
    pub(crate) fn touch(&mut self, key: &str) -> Option<(IndexRecord, IndexLine)> {
        self.tier.touch(key)?;
        let record = self.record(key)?;
        let line = IndexLine::Touch {
            v: INDEX_FORMAT_VERSION,
            seq: self.seq(),
            key: key.to_string(),
            last_access: record.last_access,
        };
        Some((record, line))
    }

    fn remove_entry(&mut self, key: &str) -> Option<IndexRecord> {
        let record = self.record(key)?;
        self.tier.remove(key);
        Some(record)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<(IndexRecord, IndexLine)> {
        let record = self.remove_entry(key)?;
        let line = IndexLine::Remove {
            v: INDEX_FORMAT_VERSION,
            seq: self.seq(),
            key: key.to_string(),
        };
        Some((record, line))
    }

    /// Remove an entry only if it still points at `location`.
    pub(crate) fn remove_if_location(&mut self, key: &str, location: &str) -> Option<(IndexRecord, IndexLine)> {
        match self.tier.peek(key) {
            Some(entry) if entry.value == location => self.remove(key),
            _ => None,
        }
    }

    /// Pop least recently used records until `extra` more bytes fit.
    pub(crate) fn evict_for(&mut self, extra: u64) -> Vec<(IndexRecord, IndexLine)> {
        let mut victims = Vec::new();
        while !self.tier.fits(extra, 0) {
            let Some(entry) = self.tier.pop_lru() else {
                break;
            };
            let line = IndexLine::Remove {
                v: INDEX_FORMAT_VERSION,
                seq: self.seq(),
                key: entry.key.clone(),
            };
            let record = IndexRecord {
                key: entry.key,
                location: entry.value,
                size_bytes: entry.size_bytes,
                last_access: entry.last_access,
                created_at: entry.created_at,
            };
            victims.push((record, line));
        }
        victims
    }

    /// Records last used before `cutoff`, oldest first.
    pub(crate) fn stale_keys(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.tier
            .iter_lru()
            .filter(|entry| entry.last_access < cutoff)
            .map(|entry| entry.key.clone())
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<IndexRecord> {
        let records: Vec<IndexRecord> = self
            .tier
            .iter_lru()
            .map(|entry| IndexRecord {
                key: entry.key.clone(),
                location: entry.value.clone(),
                size_bytes: entry.size_bytes,
                last_access: entry.last_access,
                created_at: entry.created_at,
            })
            .collect();
        self.tier.drain();
        records
    }

    fn snapshot_lines(&mut self) -> Vec<IndexLine> {
        let records: Vec<IndexRecord> = self
            .tier
            .keys_lru_order()
            .iter()
            .filter_map(|key| self.record(key))
            .collect();
        let lines = records
            .into_iter()
            .map(|record| IndexLine::Put {
                v: INDEX_FORMAT_VERSION,
                seq: self.seq(),
                record,
            })
            .collect();
        self.appended_since_compact = 0;
        lines
    }
}

/// Append-only writer for the index log.
#[derive(Debug)]
pub(crate) struct IndexLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
    compact_threshold: usize,
}

impl IndexLog {
    pub(crate) fn new(path: Option<PathBuf>, compact_threshold: usize) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
            compact_threshold,
        }
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    /// Append lines; failures are logged and reported, never fatal.
    pub(crate) fn append(&self, lines: &[IndexLine]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if lines.is_empty() {
            return Ok(());
        }
        let _guard = lock(&self.write_lock);
        for line in lines {
            append_json_line(path, line)?;
        }
        Ok(())
    }

    /// Compact if enough lines were appended since the last snapshot.
    pub(crate) fn maybe_compact(&self, index: &Mutex<SecondaryIndex>) -> Result<()> {
        let due = lock(index).appended_since_compact >= self.compact_threshold;
        if due {
            self.compact(index)?;
        }
        Ok(())
    }

    /// Rewrite the log as a snapshot of the current index.
    pub(crate) fn compact(&self, index: &Mutex<SecondaryIndex>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        // Holding the write lock keeps concurrent appends out of the old file
        // while it is being replaced.
        let _guard = lock(&self.write_lock);
        let lines = lock(index).snapshot_lines();

        let mut buffer = Vec::new();
        for line in &lines {
            serde_json::to_writer(&mut buffer, line)?;
            buffer.push(b'\n');
        }
        atomic_write_bytes(path, &buffer)?;
        debug!("Compacted cache index to {} records", lines.len());
        Ok(())
    }

    /// Rebuild the index from the log, dropping records whose storage is gone
    /// and evicting down to `budget_bytes` if the budget shrank.
    pub(crate) fn recover(
        &self,
        storage: &dyn StorageBackend,
        budget_bytes: u64,
    ) -> Result<(SecondaryIndex, RecoveryReport)> {
        let mut index = SecondaryIndex::new(budget_bytes);
        let mut report = RecoveryReport::default();
        let Some(path) = &self.path else {
            return Ok((index, report));
        };

        let (mut lines, corrupt) = read_json_lines::<IndexLine>(path)?;
        report.corrupt_lines = corrupt;
        let before = lines.len();
        lines.retain(|line| line.version() == INDEX_FORMAT_VERSION);
        report.corrupt_lines += before - lines.len();
        lines.sort_by_key(IndexLine::seq);
        let next_seq = lines.last().map(|line| line.seq() + 1).unwrap_or(0);

        let mut records: HashMap<String, IndexRecord> = HashMap::new();
        for line in lines {
            match line {
                IndexLine::Put { record, .. } => {
                    records.insert(record.key.clone(), record);
                }
                IndexLine::Touch {
                    key, last_access, ..
                } => {
                    if let Some(record) = records.get_mut(&key) {
                        record.last_access = last_access;
                    }
                }
                IndexLine::Remove { key, .. } => {
                    records.remove(&key);
                }
            }
        }

        let mut survivors: Vec<IndexRecord> = records
            .into_values()
            .filter(|record| {
                let present = storage.exists(&record.location);
                if !present {
                    warn!(
                        key = %record.key,
                        location = %record.location,
                        "Dropping cache index record with missing storage"
                    );
                    report.missing_storage += 1;
                }
                present
            })
            .collect();
        survivors.sort_by(|a, b| a.last_access.cmp(&b.last_access).then_with(|| a.key.cmp(&b.key)));

        index.next_seq = next_seq;
        for record in survivors {
            index.tier.insert_with_times(
                record.key,
                record.location,
                record.size_bytes,
                record.created_at,
                record.last_access,
                0,
            );
        }

        for (victim, _) in index.evict_for(0) {
            if let Err(e) = storage.delete(&victim.location) {
                warn!(key = %victim.key, "Failed to delete over-budget entry: {}", e);
            }
            report.over_budget_evicted += 1;
        }

        report.recovered = index.tier.len();
        info!(
            recovered = report.recovered,
            missing = report.missing_storage,
            corrupt = report.corrupt_lines,
            bytes = index.tier.current_bytes(),
            "Recovered secondary cache index"
        );
        Ok((index, report))
    }
}
