//! Atomic file operations for crash-safe persistence.
//!
//! Writes go to a temp file with a PID+TID suffix, are fsynced, then renamed
//! over the target. A reader therefore sees either the old or the new file,
//! never a torn one.

use crate::error::{ResidencyError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use tracing::{debug, warn};

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let Some(bytes) = read_bytes_if_exists(path)? else {
        return Ok(None);
    };

    let data: T = serde_json::from_slice(&bytes).map_err(|e| ResidencyError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically, optionally keeping a `.bak` of the
/// previous contents.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T, keep_backup: bool) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(data).map_err(|e| ResidencyError::Json {
        message: format!("Failed to serialize data: {}", e),
        source: Some(e),
    })?;

    if keep_backup && path.exists() {
        let backup_path = path.with_extension("json.bak");
        if let Err(e) = fs::copy(path, &backup_path) {
            warn!("Failed to create backup {}: {}", backup_path.display(), e);
        } else {
            debug!("Created backup: {}", backup_path.display());
        }
    }

    atomic_write_bytes(path, &serialized)
}

/// Write raw bytes to a file atomically.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;

    let temp_path = temp_path_for(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| ResidencyError::Storage {
                message: format!("Failed to create temp file {}", temp_path.display()),
                path: Some(temp_path.clone()),
                source: Some(e),
            })?;

        file.write_all(bytes).map_err(|e| ResidencyError::Storage {
            message: format!("Failed to write temp file {}", temp_path.display()),
            path: Some(temp_path.clone()),
            source: Some(e),
        })?;

        file.sync_all().map_err(|e| ResidencyError::Storage {
            message: format!("Failed to sync temp file {}", temp_path.display()),
            path: Some(temp_path.clone()),
            source: Some(e),
        })?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        ResidencyError::Storage {
            message: format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        }
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Read a whole file, returning `None` when it does not exist.
pub fn read_bytes_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ResidencyError::Storage {
                message: format!("Failed to open {}", path.display()),
                path: Some(path.to_path_buf()),
                source: Some(e),
            })
        }
    };

    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| ResidencyError::Storage {
            message: format!("Failed to read {}", path.display()),
            path: Some(path.to_path_buf()),
            source: Some(e),
        })?;
    Ok(Some(contents))
}

/// Append one JSON record as a line and fsync it.
///
/// A crash mid-append leaves at most one partial trailing line, which
/// [`read_json_lines`] skips.
pub fn append_json_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    ensure_parent_dir(path)?;

    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ResidencyError::io_with_path(e, path))?;
    file.write_all(&line)
        .map_err(|e| ResidencyError::io_with_path(e, path))?;
    file.sync_data()
        .map_err(|e| ResidencyError::io_with_path(e, path))?;
    Ok(())
}

/// Read JSON-lines records, validating each line independently.
///
/// Returns the parsed records and the number of lines that were dropped as
/// corrupt or incomplete.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(ResidencyError::io_with_path(e, path)),
    };

    let mut records = Vec::new();
    let mut dropped = 0;
    for line in BufReader::new(file).split(b'\n') {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Stopped reading {} after I/O error: {}", path.display(), e);
                break;
            }
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<T>(&line) {
            Ok(record) => records.push(record),
            Err(_) => dropped += 1,
        }
    }

    if dropped > 0 {
        warn!("Dropped {} unreadable records from {}", dropped, path.display());
    }
    Ok((records, dropped))
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ResidencyError::io_with_path(e, path)),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| ResidencyError::Storage {
                message: format!("Failed to create directory {}", parent.display()),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{}.tmp", process::id(), thread_id()));
    path.with_file_name(name)
}

/// Get a unique numeric identifier for the current thread.
fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestRecord {
        name: String,
        value: i32,
    }

    #[test]
    fn test_atomic_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("record.json");

        let data = TestRecord {
            name: "test".to_string(),
            value: 42,
        };
        atomic_write_json(&path, &data, false).unwrap();

        let read_back: Option<TestRecord> = atomic_read_json(&path).unwrap();
        assert_eq!(read_back, Some(data));
    }

    #[test]
    fn test_atomic_write_creates_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("record.json");

        let first = TestRecord {
            name: "first".to_string(),
            value: 1,
        };
        let second = TestRecord {
            name: "second".to_string(),
            value: 2,
        };
        atomic_write_json(&path, &first, true).unwrap();
        atomic_write_json(&path, &second, true).unwrap();

        let backup: Option<TestRecord> =
            atomic_read_json(&path.with_extension("json.bak")).unwrap();
        assert_eq!(backup, Some(first));
    }

    #[test]
    fn test_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let result: Option<TestRecord> =
            atomic_read_json(&temp_dir.path().join("missing.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_json_lines_skip_torn_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.jsonl");

        append_json_line(
            &path,
            &TestRecord {
                name: "a".to_string(),
                value: 1,
            },
        )
        .unwrap();
        // Simulate a crash halfway through the second append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"name":"b","val"#).unwrap();
        drop(file);

        let (records, dropped): (Vec<TestRecord>, usize) = read_json_lines(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "a");
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_remove_if_exists_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blob.bin");
        atomic_write_bytes(&path, b"payload").unwrap();

        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
