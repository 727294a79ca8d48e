//! Checksum-verified chunked loading that survives interruption.
//!
//! A loader owns one work directory holding `progress.json` and the stored
//! chunks. The directory is locked with an advisory file lock so that two
//! processes never drive the same load. Progress is persisted after every
//! chunk; on restart [`ResumableLoader::resume_loading`] re-verifies stored
//! chunks and reports what is still missing.

use super::task::{LoadProgress, LoadState, LoadingTask};
use crate::cancel::CancellationToken;
use crate::checksum::{Checksum, ChecksumAlgorithm, StreamingHasher};
use crate::config::LoaderSettings;
use crate::error::{ResidencyError, Result};
use crate::retry::{retry_async, RetryConfig};
use crate::storage::atomic::{atomic_read_json, atomic_write_bytes, atomic_write_json, remove_if_exists};
use crate::sync::lock;
use async_trait::async_trait;
use bytes::Bytes;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

const PROGRESS_FILE: &str = "progress.json";
const LOCK_FILE: &str = ".lock";
const CHUNK_DIR: &str = "chunks";

/// Where chunk bytes come from when the loader drives the load itself.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Fetch `len` bytes of chunk `index`, starting at byte `offset`.
    async fn fetch(&self, index: u64, offset: u64, len: u64) -> Result<Bytes>;
}

/// Result of handing a chunk to the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk stored and verified; `remaining` chunks are still missing.
    Stored { remaining: u64 },
    /// Chunk was already verified; nothing changed.
    Duplicate,
    /// Last chunk stored; the artifact was assembled and verified.
    Finalized { path: PathBuf },
}

/// Resumable loader for one artifact at a time.
#[derive(Debug)]
pub struct ResumableLoader {
    work_dir: PathBuf,
    settings: LoaderSettings,
    task: Mutex<Option<LoadingTask>>,
    persist_gate: Mutex<()>,
    _lock_file: File,
}

impl ResumableLoader {
    /// Open (or create) a work directory and take its lock.
    ///
    /// Persisted progress is loaded but not re-verified until
    /// [`resume_loading`](Self::resume_loading) is called.
    pub fn open(work_dir: impl Into<PathBuf>, settings: LoaderSettings) -> Result<Self> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir).map_err(|e| ResidencyError::io_with_path(e, &work_dir))?;

        let lock_path = work_dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| ResidencyError::io_with_path(e, &lock_path))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            ResidencyError::InvalidState(format!(
                "loader work directory {} is in use",
                work_dir.display()
            ))
        })?;

        let progress_path = work_dir.join(PROGRESS_FILE);
        let task = match atomic_read_json::<LoadingTask>(&progress_path) {
            Ok(task) => task,
            Err(e) => {
                warn!("Ignoring unreadable load progress at {}: {}", progress_path.display(), e);
                None
            }
        };
        if let Some(task) = &task {
            info!(
                task_id = %task.task_id,
                artifact = %task.artifact_path.display(),
                verified = task.verified_chunks.len(),
                total = task.total_chunks,
                "Found persisted load progress"
            );
        }

        Ok(Self {
            work_dir,
            settings,
            task: Mutex::new(task),
            persist_gate: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn progress_path(&self) -> PathBuf {
        self.work_dir.join(PROGRESS_FILE)
    }

    fn chunk_path(&self, index: u64) -> PathBuf {
        self.work_dir
            .join(CHUNK_DIR)
            .join(format!("chunk_{:06}.part", index))
    }

    /// Begin a new load. Fails if an unfinished load already owns this work
    /// directory; resume or abort it first.
    pub fn start_loading(
        &self,
        artifact_path: impl Into<PathBuf>,
        total_size: u64,
        expected_checksum: Option<Checksum>,
    ) -> Result<LoadingTask> {
        self.begin(artifact_path.into(), total_size, expected_checksum, Vec::new())
    }

    /// Begin a new load with an expected digest for every chunk.
    ///
    /// Chunks whose payload does not match their manifest entry are rejected
    /// before anything is written.
    pub fn start_loading_with_manifest(
        &self,
        artifact_path: impl Into<PathBuf>,
        total_size: u64,
        expected_checksum: Option<Checksum>,
        chunk_checksums: Vec<Checksum>,
    ) -> Result<LoadingTask> {
        self.begin(artifact_path.into(), total_size, expected_checksum, chunk_checksums)
    }

    fn begin(
        &self,
        artifact_path: PathBuf,
        total_size: u64,
        expected_checksum: Option<Checksum>,
        manifest: Vec<Checksum>,
    ) -> Result<LoadingTask> {
        if self.settings.chunk_size_bytes == 0 {
            return Err(ResidencyError::Config {
                message: "chunk_size_bytes must be greater than zero".to_string(),
            });
        }

        let task = {
            let mut current = lock(&self.task);
            if let Some(existing) = current.as_ref() {
                if existing.state != LoadState::Complete {
                    return Err(ResidencyError::InvalidState(format!(
                        "load {} of {} is unfinished",
                        existing.task_id,
                        existing.artifact_path.display()
                    )));
                }
            }

            let mut task = LoadingTask::new(
                artifact_path,
                total_size,
                self.settings.chunk_size_bytes,
                expected_checksum,
            );
            if !manifest.is_empty() {
                if manifest.len() as u64 != task.total_chunks {
                    return Err(ResidencyError::Validation {
                        field: "chunk_checksums".to_string(),
                        message: format!(
                            "expected {} chunk checksums, got {}",
                            task.total_chunks,
                            manifest.len()
                        ),
                    });
                }
                task.manifest = (0..).zip(manifest).collect();
            }
            *current = Some(task.clone());
            task
        };

        let chunk_dir = self.work_dir.join(CHUNK_DIR);
        if chunk_dir.exists() {
            fs::remove_dir_all(&chunk_dir).map_err(|e| ResidencyError::io_with_path(e, &chunk_dir))?;
        }
        self.persist()?;

        info!(
            task_id = %task.task_id,
            artifact = %task.artifact_path.display(),
            total_size = task.total_size,
            chunks = task.total_chunks,
            "Started resumable load"
        );
        if task.total_chunks == 0 {
            self.mark_verifying()?;
            self.finalize()?;
        }
        Ok(task)
    }

    /// Accept the payload of chunk `index`.
    ///
    /// The payload length must match the chunk geometry (only the last chunk
    /// may be short). The chunk is written durably, read back and checked
    /// against its recorded digest before it counts as verified. Each failed
    /// attempt counts against the chunk's retry allowance; once exhausted the
    /// chunk is refused until the load is resumed.
    pub fn load_chunk(&self, index: u64, bytes: &[u8]) -> Result<ChunkOutcome> {
        let (task_id, algorithm, expected) = {
            let mut guard = lock(&self.task);
            let task = guard
                .as_mut()
                .ok_or_else(|| ResidencyError::InvalidState("no active load".to_string()))?;

            if !task.state.accepts_chunks() {
                return Err(ResidencyError::InvalidState(format!(
                    "load {} is {:?}",
                    task.task_id, task.state
                )));
            }
            if index >= task.total_chunks {
                return Err(ResidencyError::InvalidChunk {
                    index,
                    message: format!("index out of range (total {})", task.total_chunks),
                });
            }
            if task.verified_chunks.contains(&index) {
                return Ok(ChunkOutcome::Duplicate);
            }

            let attempts = task.chunk_attempts.get(&index).copied().unwrap_or(0);
            if attempts > self.settings.max_retries {
                return Err(ResidencyError::RetriesExhausted {
                    index,
                    attempts,
                    message: "chunk refused until the load is resumed".to_string(),
                });
            }
            if attempts > 0 {
                task.counters.retries += 1;
            }
            task.state = LoadState::InProgress;

            let expected_len = task.expected_chunk_len(index);
            if bytes.len() as u64 != expected_len {
                let message = format!("expected {} bytes, got {}", expected_len, bytes.len());
                drop(guard);
                self.record_failure(index);
                return Err(ResidencyError::InvalidChunk { index, message });
            }

            let expected = task.manifest.get(&index).cloned();
            let algorithm = expected
                .as_ref()
                .map(|c| c.algorithm)
                .unwrap_or(ChecksumAlgorithm::Sha256);
            (task.task_id.clone(), algorithm, expected)
        };

        let scope = format!("chunk {}", index);
        let checksum = Checksum::compute(algorithm, bytes);
        if let Some(expected) = &expected {
            if let Err(e) = expected.expect_eq(&scope, &checksum) {
                warn!(chunk = index, "Rejected corrupted chunk: {}", e);
                self.record_failure(index);
                return Err(e);
            }
        }

        if let Err(e) = self.store_chunk(index, bytes, &checksum) {
            warn!(chunk = index, "Failed to store chunk: {}", e);
            self.record_failure(index);
            return Err(e);
        }

        let (remaining, complete) = {
            let mut guard = lock(&self.task);
            let task = match guard.as_mut() {
                Some(task) if task.task_id == task_id => task,
                _ => {
                    return Err(ResidencyError::InvalidState(
                        "load was aborted while the chunk was being stored".to_string(),
                    ))
                }
            };
            if task.verified_chunks.insert(index) {
                task.counters.bytes_loaded += bytes.len() as u64;
            }
            task.loaded_chunks.insert(index);
            task.chunk_checksums.insert(index, checksum);
            task.chunk_attempts.remove(&index);
            task.touch();

            let complete = task.is_fully_verified() && task.state == LoadState::InProgress;
            if complete {
                task.state = LoadState::Verifying;
            }
            (task.total_chunks - task.verified_chunks.len() as u64, complete)
        };
        self.persist()?;
        debug!(chunk = index, remaining, "Stored chunk");

        if complete {
            let path = self.finalize()?;
            return Ok(ChunkOutcome::Finalized { path });
        }
        Ok(ChunkOutcome::Stored { remaining })
    }

    fn store_chunk(&self, index: u64, bytes: &[u8], checksum: &Checksum) -> Result<()> {
        let path = self.chunk_path(index);
        atomic_write_bytes(&path, bytes)?;
        let stored = fs::read(&path).map_err(|e| ResidencyError::io_with_path(e, &path))?;
        checksum.verify(&format!("stored chunk {}", index), &stored)
    }

    fn record_failure(&self, index: u64) {
        {
            let mut guard = lock(&self.task);
            if let Some(task) = guard.as_mut() {
                task.counters.failed_chunks += 1;
                *task.chunk_attempts.entry(index).or_insert(0) += 1;
                task.touch();
            }
        }
        if let Err(e) = self.persist() {
            warn!("Failed to persist load progress after chunk failure: {}", e);
        }
    }

    /// Resume after a restart or failure.
    ///
    /// Re-verifies every stored chunk against its recorded digest (dropping
    /// any that are missing or corrupt), clears per-chunk retry allowances and
    /// returns the indices still to load. When nothing remains the artifact is
    /// assembled immediately.
    pub fn resume_loading(&self) -> Result<Vec<u64>> {
        let snapshot = lock(&self.task)
            .clone()
            .ok_or_else(|| ResidencyError::NotFound("no load progress to resume".to_string()))?;
        if snapshot.state == LoadState::Complete {
            return Ok(Vec::new());
        }

        let mut invalid = Vec::new();
        for &index in &snapshot.verified_chunks {
            let valid = match (snapshot.chunk_checksums.get(&index), fs::read(self.chunk_path(index))) {
                (Some(checksum), Ok(stored)) => checksum.verify(&format!("chunk {}", index), &stored).is_ok(),
                _ => false,
            };
            if !valid {
                warn!(chunk = index, "Stored chunk missing or corrupt; it will be reloaded");
                invalid.push(index);
            }
        }

        let (remaining, complete) = {
            let mut guard = lock(&self.task);
            let task = match guard.as_mut() {
                Some(task) if task.task_id == snapshot.task_id => task,
                _ => {
                    return Err(ResidencyError::InvalidState(
                        "load changed while resuming".to_string(),
                    ))
                }
            };
            for index in &invalid {
                task.verified_chunks.remove(index);
                task.loaded_chunks.remove(index);
                task.chunk_checksums.remove(index);
                task.counters.bytes_loaded = task
                    .counters
                    .bytes_loaded
                    .saturating_sub(task.expected_chunk_len(*index));
            }
            task.chunk_attempts.clear();
            let complete = task.is_fully_verified();
            task.state = if complete {
                LoadState::Verifying
            } else {
                LoadState::InProgress
            };
            task.touch();
            (task.remaining(), complete)
        };
        self.persist()?;

        info!(
            task_id = %snapshot.task_id,
            remaining = remaining.len(),
            dropped = invalid.len(),
            "Resumed load"
        );
        if complete {
            self.finalize()?;
        }
        Ok(remaining)
    }

    /// Discard stored chunks so they can be loaded again.
    ///
    /// This is the way out of a failed artifact checksum: the chunks are
    /// retained on failure, and the caller drops the ones it suspects and
    /// re-submits them. Clears the chunks' retry allowances and reopens the
    /// load. Returns the indices still to load.
    pub fn invalidate_chunks(&self, indices: &[u64]) -> Result<Vec<u64>> {
        let remaining = {
            let mut guard = lock(&self.task);
            let task = guard
                .as_mut()
                .ok_or_else(|| ResidencyError::InvalidState("no active load".to_string()))?;
            if task.state == LoadState::Complete {
                return Err(ResidencyError::InvalidState(format!(
                    "load {} is already complete",
                    task.task_id
                )));
            }
            if let Some(&index) = indices.iter().find(|&&index| index >= task.total_chunks) {
                return Err(ResidencyError::InvalidChunk {
                    index,
                    message: format!("index out of range (total {})", task.total_chunks),
                });
            }

            for &index in indices {
                if task.verified_chunks.remove(&index) {
                    task.counters.bytes_loaded = task
                        .counters
                        .bytes_loaded
                        .saturating_sub(task.expected_chunk_len(index));
                }
                task.loaded_chunks.remove(&index);
                task.chunk_checksums.remove(&index);
                task.chunk_attempts.remove(&index);
                let path = self.chunk_path(index);
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(ResidencyError::io_with_path(e, &path));
                    }
                }
            }
            task.state = if task.is_fully_verified() {
                LoadState::Verifying
            } else {
                LoadState::InProgress
            };
            task.touch();
            task.remaining()
        };
        self.persist()?;
        info!(invalidated = indices.len(), remaining = remaining.len(), "Invalidated stored chunks");

        if remaining.is_empty() {
            self.finalize()?;
        }
        Ok(remaining)
    }

    fn mark_verifying(&self) -> Result<()> {
        if let Some(task) = lock(&self.task).as_mut() {
            task.state = LoadState::Verifying;
        }
        self.persist()
    }

    /// Assemble chunks in index order and verify the whole artifact.
    fn finalize(&self) -> Result<PathBuf> {
        let task = lock(&self.task)
            .clone()
            .ok_or_else(|| ResidencyError::InvalidState("no active load".to_string()))?;
        let target = task.artifact_path.clone();
        let partial = partial_path(&target);
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ResidencyError::io_with_path(e, parent))?;
        }

        let algorithm = task
            .expected_checksum
            .as_ref()
            .map(|c| c.algorithm)
            .unwrap_or(ChecksumAlgorithm::Sha256);
        let mut hasher = StreamingHasher::new(algorithm);

        let assembled = (|| -> Result<()> {
            let file = File::create(&partial).map_err(|e| ResidencyError::io_with_path(e, &partial))?;
            let mut writer = BufWriter::new(file);
            for index in 0..task.total_chunks {
                let path = self.chunk_path(index);
                let bytes = fs::read(&path).map_err(|e| ResidencyError::io_with_path(e, &path))?;
                if let Some(checksum) = task.chunk_checksums.get(&index) {
                    checksum.verify(&format!("chunk {}", index), &bytes)?;
                }
                hasher.update(&bytes);
                writer
                    .write_all(&bytes)
                    .map_err(|e| ResidencyError::io_with_path(e, &partial))?;
            }
            let file = writer
                .into_inner()
                .map_err(|e| ResidencyError::io_with_path(e.into_error(), &partial))?;
            file.sync_all()
                .map_err(|e| ResidencyError::io_with_path(e, &partial))
        })();

        if let Err(e) = assembled {
            let _ = fs::remove_file(&partial);
            self.set_state(&task.task_id, LoadState::Failed);
            error!(task_id = %task.task_id, "Failed to assemble artifact: {}", e);
            return Err(e);
        }

        let actual = hasher.finalize();
        if let Some(expected) = &task.expected_checksum {
            if let Err(e) = expected.expect_eq(&target.display().to_string(), &actual) {
                let _ = fs::remove_file(&partial);
                self.set_state(&task.task_id, LoadState::Failed);
                error!(
                    task_id = %task.task_id,
                    "Artifact checksum mismatch; chunks retained: {}",
                    e
                );
                return Err(e);
            }
        }

        fs::rename(&partial, &target).map_err(|e| ResidencyError::io_with_path(e, &target))?;

        let chunk_dir = self.work_dir.join(CHUNK_DIR);
        if chunk_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&chunk_dir) {
                warn!("Failed to remove chunk directory {}: {}", chunk_dir.display(), e);
            }
        }
        {
            let _persist = lock(&self.persist_gate);
            remove_if_exists(&self.progress_path())?;
            if let Some(current) = lock(&self.task).as_mut() {
                current.state = LoadState::Complete;
                current.touch();
            }
        }

        info!(
            task_id = %task.task_id,
            artifact = %target.display(),
            checksum = %actual,
            "Finalized artifact"
        );
        Ok(target)
    }

    fn set_state(&self, task_id: &str, state: LoadState) {
        {
            let mut guard = lock(&self.task);
            if let Some(task) = guard.as_mut().filter(|t| t.task_id == task_id) {
                task.state = state;
                task.touch();
            }
        }
        if let Err(e) = self.persist() {
            warn!("Failed to persist load progress: {}", e);
        }
    }

    /// Write the latest task state. Snapshots are taken under the persist
    /// gate, so a slower writer can never overwrite newer progress.
    fn persist(&self) -> Result<()> {
        let _persist = lock(&self.persist_gate);
        let snapshot = lock(&self.task).clone();
        match snapshot {
            Some(task) if task.state != LoadState::Complete => {
                atomic_write_json(&self.progress_path(), &task, false)
            }
            _ => Ok(()),
        }
    }

    /// Current progress, if a load exists.
    pub fn progress(&self) -> Option<LoadProgress> {
        lock(&self.task).as_ref().map(LoadProgress::from)
    }

    /// Drop the current load and every file it wrote.
    pub fn abort(&self) -> Result<()> {
        let _persist = lock(&self.persist_gate);
        let task = lock(&self.task).take();

        let chunk_dir = self.work_dir.join(CHUNK_DIR);
        if chunk_dir.exists() {
            fs::remove_dir_all(&chunk_dir).map_err(|e| ResidencyError::io_with_path(e, &chunk_dir))?;
        }
        remove_if_exists(&self.progress_path())?;
        if let Some(task) = task {
            let _ = fs::remove_file(partial_path(&task.artifact_path));
            info!(task_id = %task.task_id, "Aborted load");
        }
        Ok(())
    }

    /// Pull every remaining chunk from `source`.
    ///
    /// Each chunk is retried with exponential backoff on transient failures;
    /// cancellation is observed between chunks only. Returns the finalized
    /// artifact path.
    pub async fn load_from_source(
        &self,
        source: &dyn ChunkSource,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let (remaining, chunk_size, total_size, target) = {
            let guard = lock(&self.task);
            let task = guard
                .as_ref()
                .ok_or_else(|| ResidencyError::InvalidState("no active load".to_string()))?;
            if task.state == LoadState::Complete {
                return Ok(task.artifact_path.clone());
            }
            (
                task.remaining(),
                task.chunk_size,
                task.total_size,
                task.artifact_path.clone(),
            )
        };

        let config = RetryConfig::for_loader(&self.settings);
        for index in remaining {
            cancel.check()?;
            let offset = index * chunk_size;
            let len = chunk_size.min(total_size - offset);

            let (result, stats) = retry_async(
                &config,
                |_| async move {
                    let bytes = source.fetch(index, offset, len).await?;
                    self.load_chunk(index, &bytes)
                },
                ResidencyError::is_retryable,
            )
            .await;

            match result {
                Ok(ChunkOutcome::Finalized { path }) => return Ok(path),
                Ok(_) => {}
                Err(e) if e.is_retryable() && stats.attempts >= config.max_attempts => {
                    return Err(ResidencyError::RetriesExhausted {
                        index,
                        attempts: stats.attempts,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        // Every chunk was already stored, e.g. finalize ran from resume.
        match self.progress().map(|p| p.state) {
            Some(LoadState::Complete) => Ok(target),
            _ => Err(ResidencyError::InvalidState(
                "load did not complete".to_string(),
            )),
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn settings(chunk_size: u64) -> LoaderSettings {
        LoaderSettings {
            chunk_size_bytes: chunk_size,
            max_retries: 2,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
        }
    }

    fn artifact(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn chunk(data: &[u8], index: u64, size: u64) -> &[u8] {
        let start = (index * size) as usize;
        let end = (start + size as usize).min(data.len());
        &data[start..end]
    }

    #[test]
    fn test_interrupted_load_resumes_with_remaining_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let work = temp_dir.path().join("work");
        let target = temp_dir.path().join("model.bin");
        let data = artifact(95);
        let expected = Checksum::sha256(&data);

        {
            let loader = ResumableLoader::open(&work, settings(10)).unwrap();
            loader
                .start_loading(&target, data.len() as u64, Some(expected.clone()))
                .unwrap();
            for index in 0..6 {
                loader.load_chunk(index, chunk(&data, index, 10)).unwrap();
            }
        }

        let loader = ResumableLoader::open(&work, settings(10)).unwrap();
        let remaining = loader.resume_loading().unwrap();
        assert_eq!(remaining, vec![6, 7, 8, 9]);

        let mut outcome = None;
        for index in remaining {
            outcome = Some(loader.load_chunk(index, chunk(&data, index, 10)).unwrap());
        }
        assert_eq!(outcome, Some(ChunkOutcome::Finalized { path: target.clone() }));
        assert_eq!(fs::read(&target).unwrap(), data);
        assert!(!work.join(PROGRESS_FILE).exists());
        assert!(!work.join(CHUNK_DIR).exists());
        assert_eq!(loader.progress().unwrap().state, LoadState::Complete);
    }

    #[test]
    fn test_corrupted_chunk_rejected_without_touching_verified_set() {
        let temp_dir = TempDir::new().unwrap();
        let data = artifact(30);
        let manifest: Vec<Checksum> = (0..3).map(|i| Checksum::sha256(chunk(&data, i, 10))).collect();
        let loader = ResumableLoader::open(temp_dir.path().join("work"), settings(10)).unwrap();
        loader
            .start_loading_with_manifest(temp_dir.path().join("model.bin"), 30, None, manifest)
            .unwrap();
        loader.load_chunk(0, chunk(&data, 0, 10)).unwrap();

        let mut corrupted = chunk(&data, 1, 10).to_vec();
        corrupted[3] ^= 0xff;
        let err = loader.load_chunk(1, &corrupted).unwrap_err();
        assert!(matches!(err, ResidencyError::ChecksumMismatch { .. }));

        let progress = loader.progress().unwrap();
        assert_eq!(progress.verified_chunks, 1);
        assert_eq!(progress.failed_chunks, 1);
        assert!(!loader.chunk_path(1).exists());
    }

    #[test]
    fn test_wrong_length_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let loader = ResumableLoader::open(temp_dir.path().join("work"), settings(10)).unwrap();
        loader.start_loading(temp_dir.path().join("a.bin"), 25, None).unwrap();

        assert!(matches!(
            loader.load_chunk(0, &[0u8; 9]),
            Err(ResidencyError::InvalidChunk { index: 0, .. })
        ));
        // Last chunk may be short but must be exact.
        assert!(loader.load_chunk(2, &[0u8; 5]).is_ok());
        assert!(matches!(
            loader.load_chunk(3, &[0u8; 5]),
            Err(ResidencyError::InvalidChunk { index: 3, .. })
        ));
    }

    #[test]
    fn test_retries_exhausted_after_max_failures() {
        let temp_dir = TempDir::new().unwrap();
        let loader = ResumableLoader::open(temp_dir.path().join("work"), settings(10)).unwrap();
        loader.start_loading(temp_dir.path().join("a.bin"), 20, None).unwrap();

        for _ in 0..3 {
            assert!(matches!(
                loader.load_chunk(0, &[0u8; 3]),
                Err(ResidencyError::InvalidChunk { .. })
            ));
        }
        assert!(matches!(
            loader.load_chunk(0, &[0u8; 10]),
            Err(ResidencyError::RetriesExhausted { index: 0, .. })
        ));

        // Resuming restores the allowance.
        loader.resume_loading().unwrap();
        assert!(loader.load_chunk(0, &[0u8; 10]).is_ok());
    }

    #[test]
    fn test_artifact_checksum_mismatch_is_fatal_and_keeps_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("model.bin");
        let data = artifact(20);
        let loader = ResumableLoader::open(temp_dir.path().join("work"), settings(10)).unwrap();
        loader
            .start_loading(&target, 20, Some(Checksum::sha256(b"something else")))
            .unwrap();

        loader.load_chunk(0, chunk(&data, 0, 10)).unwrap();
        let err = loader.load_chunk(1, chunk(&data, 1, 10)).unwrap_err();

        assert!(matches!(err, ResidencyError::ChecksumMismatch { .. }));
        assert_eq!(loader.progress().unwrap().state, LoadState::Failed);
        assert!(!target.exists());
        assert!(loader.chunk_path(0).exists());
        assert!(loader.chunk_path(1).exists());
    }

    #[test]
    fn test_fixed_chunk_accepted_after_invalidation() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("model.bin");
        let data = artifact(30);
        let loader = ResumableLoader::open(temp_dir.path().join("work"), settings(10)).unwrap();
        loader
            .start_loading(&target, 30, Some(Checksum::sha256(&data)))
            .unwrap();

        let mut corrupted = chunk(&data, 1, 10).to_vec();
        corrupted[0] ^= 0xff;
        loader.load_chunk(0, chunk(&data, 0, 10)).unwrap();
        loader.load_chunk(1, &corrupted).unwrap();
        assert!(matches!(
            loader.load_chunk(2, chunk(&data, 2, 10)),
            Err(ResidencyError::ChecksumMismatch { .. })
        ));

        // Resuming alone cannot help: every stored chunk matches its digest.
        assert!(matches!(
            loader.resume_loading(),
            Err(ResidencyError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            loader.load_chunk(1, chunk(&data, 1, 10)),
            Err(ResidencyError::InvalidState(_))
        ));

        assert_eq!(loader.invalidate_chunks(&[1]).unwrap(), vec![1]);
        assert_eq!(loader.progress().unwrap().state, LoadState::InProgress);
        assert!(!loader.chunk_path(1).exists());

        let outcome = loader.load_chunk(1, chunk(&data, 1, 10)).unwrap();
        assert_eq!(outcome, ChunkOutcome::Finalized { path: target.clone() });
        assert_eq!(fs::read(&target).unwrap(), data);
        assert!(matches!(
            loader.invalidate_chunks(&[0]),
            Err(ResidencyError::InvalidState(_))
        ));
    }

    #[test]
    fn test_invalidate_rejects_out_of_range_index() {
        let temp_dir = TempDir::new().unwrap();
        let loader = ResumableLoader::open(temp_dir.path().join("work"), settings(10)).unwrap();
        loader.start_loading(temp_dir.path().join("a.bin"), 20, None).unwrap();
        loader.load_chunk(0, &[1u8; 10]).unwrap();

        assert!(matches!(
            loader.invalidate_chunks(&[0, 2]),
            Err(ResidencyError::InvalidChunk { index: 2, .. })
        ));
        assert_eq!(loader.progress().unwrap().verified_chunks, 1);
    }

    #[test]
    fn test_resume_drops_corrupted_stored_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let work = temp_dir.path().join("work");
        let data = artifact(30);
        {
            let loader = ResumableLoader::open(&work, settings(10)).unwrap();
            loader.start_loading(temp_dir.path().join("m.bin"), 30, None).unwrap();
            loader.load_chunk(0, chunk(&data, 0, 10)).unwrap();
            loader.load_chunk(1, chunk(&data, 1, 10)).unwrap();
            fs::write(loader.chunk_path(1), b"garbage!!!").unwrap();
        }

        let loader = ResumableLoader::open(&work, settings(10)).unwrap();
        assert_eq!(loader.resume_loading().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_work_dir_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let _first = ResumableLoader::open(temp_dir.path(), settings(10)).unwrap();
        assert!(matches!(
            ResumableLoader::open(temp_dir.path(), settings(10)),
            Err(ResidencyError::InvalidState(_))
        ));
    }

    #[test]
    fn test_abort_removes_state() {
        let temp_dir = TempDir::new().unwrap();
        let work = temp_dir.path().join("work");
        let loader = ResumableLoader::open(&work, settings(10)).unwrap();
        loader.start_loading(temp_dir.path().join("m.bin"), 20, None).unwrap();
        loader.load_chunk(0, &[1u8; 10]).unwrap();

        loader.abort().unwrap();
        assert!(loader.progress().is_none());
        assert!(!work.join(PROGRESS_FILE).exists());
        assert!(!work.join(CHUNK_DIR).exists());
        assert!(loader.start_loading(temp_dir.path().join("m.bin"), 20, None).is_ok());
    }

    struct FlakySource {
        data: Vec<u8>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ChunkSource for FlakySource {
        async fn fetch(&self, _index: u64, offset: u64, len: u64) -> Result<Bytes> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ResidencyError::Storage {
                    message: "connection reset".to_string(),
                    path: None,
                    source: None,
                });
            }
            let start = offset as usize;
            Ok(Bytes::copy_from_slice(&self.data[start..start + len as usize]))
        }
    }

    #[tokio::test]
    async fn test_load_from_source_retries_transient_failures() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("model.bin");
        let data = artifact(45);
        let source = FlakySource {
            data: data.clone(),
            failures_left: AtomicU32::new(2),
        };
        let loader = ResumableLoader::open(temp_dir.path().join("work"), settings(10)).unwrap();
        loader
            .start_loading(&target, 45, Some(Checksum::sha256(&data)))
            .unwrap();

        let path = loader
            .load_from_source(&source, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, target);
        assert_eq!(fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_load_from_source_stops_when_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let source = FlakySource {
            data: artifact(20),
            failures_left: AtomicU32::new(0),
        };
        let loader = ResumableLoader::open(temp_dir.path().join("work"), settings(10)).unwrap();
        loader.start_loading(temp_dir.path().join("m.bin"), 20, None).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = loader.load_from_source(&source, &cancel).await.unwrap_err();
        assert!(matches!(err, ResidencyError::Cancelled));
        assert_eq!(loader.progress().unwrap().verified_chunks, 0);
    }
}
