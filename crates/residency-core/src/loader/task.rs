//! Loading task state and its persisted form.

use crate::checksum::Checksum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Lifecycle of a resumable load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Init,
    InProgress,
    Verifying,
    Complete,
    Failed,
}

impl LoadState {
    /// Whether chunks may still be accepted.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, LoadState::Init | LoadState::InProgress)
    }
}

/// Running counters for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadCounters {
    pub bytes_loaded: u64,
    pub failed_chunks: u64,
    pub retries: u64,
}

/// A resumable chunked load of one artifact.
///
/// Persisted after every chunk so that a restarted process can resume where
/// the previous one stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadingTask {
    pub task_id: String,
    pub artifact_path: PathBuf,
    pub total_size: u64,
    pub expected_checksum: Option<Checksum>,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub loaded_chunks: BTreeSet<u64>,
    pub verified_chunks: BTreeSet<u64>,
    /// Expected per-chunk digests, when a manifest was supplied.
    #[serde(default)]
    pub manifest: BTreeMap<u64, Checksum>,
    /// Digest recorded for each stored chunk.
    #[serde(default)]
    pub chunk_checksums: BTreeMap<u64, Checksum>,
    /// Failed attempts per chunk since it was last accepted.
    #[serde(default)]
    pub chunk_attempts: BTreeMap<u64, u32>,
    pub counters: LoadCounters,
    pub state: LoadState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoadingTask {
    pub(crate) fn new(
        artifact_path: PathBuf,
        total_size: u64,
        chunk_size: u64,
        expected_checksum: Option<Checksum>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            artifact_path,
            total_size,
            expected_checksum,
            chunk_size,
            total_chunks: total_size.div_ceil(chunk_size),
            loaded_chunks: BTreeSet::new(),
            verified_chunks: BTreeSet::new(),
            manifest: BTreeMap::new(),
            chunk_checksums: BTreeMap::new(),
            chunk_attempts: BTreeMap::new(),
            counters: LoadCounters::default(),
            state: LoadState::Init,
            created_at: now,
            updated_at: now,
        }
    }

    /// Exact byte length chunk `index` must have.
    pub fn expected_chunk_len(&self, index: u64) -> u64 {
        let start = index * self.chunk_size;
        self.chunk_size.min(self.total_size.saturating_sub(start))
    }

    /// Chunk indices not yet verified, ascending.
    pub fn remaining(&self) -> Vec<u64> {
        (0..self.total_chunks)
            .filter(|index| !self.verified_chunks.contains(index))
            .collect()
    }

    pub fn is_fully_verified(&self) -> bool {
        self.verified_chunks.len() as u64 == self.total_chunks
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Snapshot of a task's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProgress {
    pub task_id: String,
    pub state: LoadState,
    pub total_chunks: u64,
    pub verified_chunks: u64,
    pub bytes_loaded: u64,
    pub total_size: u64,
    pub failed_chunks: u64,
    pub retries: u64,
}

impl LoadProgress {
    /// Completion fraction in 0.0..=1.0.
    pub fn fraction(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.verified_chunks as f64 / self.total_chunks as f64
    }
}

impl From<&LoadingTask> for LoadProgress {
    fn from(task: &LoadingTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            state: task.state,
            total_chunks: task.total_chunks,
            verified_chunks: task.verified_chunks.len() as u64,
            bytes_loaded: task.counters.bytes_loaded,
            total_size: task.total_size,
            failed_chunks: task.counters.failed_chunks,
            retries: task.counters.retries,
        }
    }
}
