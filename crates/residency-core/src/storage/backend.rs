//! Durable storage backends.
//!
//! Secondary-tier cache entries and component checkpoints are stored through
//! [`StorageBackend`] as opaque blobs addressed by a relative location string.

use super::atomic::{atomic_write_bytes, read_bytes_if_exists, remove_if_exists};
use crate::error::{ResidencyError, Result};
use crate::sync::lock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// Byte-addressable durable storage.
///
/// All operations are synchronous and potentially slow; callers must not hold
/// their own locks while invoking them.
pub trait StorageBackend: Send + Sync {
    /// Store a blob, replacing any previous blob at `location`.
    fn put(&self, location: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch a blob, or `None` if nothing is stored at `location`.
    fn get(&self, location: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a blob. Returns `false` if it was already absent.
    fn delete(&self, location: &str) -> Result<bool>;

    /// Check whether a blob exists.
    fn exists(&self, location: &str) -> bool;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Directory-backed storage with atomic writes.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Open (and create if needed) a storage directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ResidencyError::Storage {
            message: format!("Failed to create storage root {}", root.display()),
            path: Some(root.clone()),
            source: Some(e),
        })?;
        Ok(Self { root })
    }

    /// Platform cache directory used when no root is configured.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("residency")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a location to a path inside the root, rejecting escapes.
    pub fn resolve(&self, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location);
        let valid = !location.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ResidencyError::Validation {
                field: "location".to_string(),
                message: format!("{:?} is not a relative storage location", location),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl StorageBackend for FsStorage {
    fn put(&self, location: &str, bytes: &[u8]) -> Result<()> {
        atomic_write_bytes(&self.resolve(location)?, bytes)
    }

    fn get(&self, location: &str) -> Result<Option<Vec<u8>>> {
        read_bytes_if_exists(&self.resolve(location)?)
    }

    fn delete(&self, location: &str) -> Result<bool> {
        remove_if_exists(&self.resolve(location)?)
    }

    fn exists(&self, location: &str) -> bool {
        self.resolve(location).map(|p| p.is_file()).unwrap_or(false)
    }

    fn describe(&self) -> String {
        format!("fs:{}", self.root.display())
    }
}

/// In-process storage, for tests and for deployments that do not need
/// durability across restarts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, location: &str, bytes: &[u8]) -> Result<()> {
        lock(&self.blobs).insert(location.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, location: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.blobs).get(location).cloned())
    }

    fn delete(&self, location: &str) -> Result<bool> {
        Ok(lock(&self.blobs).remove(location).is_some())
    }

    fn exists(&self, location: &str) -> bool {
        lock(&self.blobs).contains_key(location)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
