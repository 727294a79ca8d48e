//! Zero-copy read access to finalized artifacts.

use crate::checksum::Checksum;
use crate::error::{ResidencyError, Result};
use crate::lifecycle::{Disposable, ModelHandle};
use memmap2::Mmap;
use std::fs::File;
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A read-only memory map of an artifact file.
///
/// Byte views share the mapping; disposing the artifact releases its own
/// reference, and the pages are unmapped once the last view is dropped.
#[derive(Debug)]
pub struct MappedArtifact {
    path: PathBuf,
    len: u64,
    map: RwLock<Option<Arc<Mmap>>>,
}

/// Borrowed-by-ownership slice of a mapping.
#[derive(Debug, Clone)]
pub struct MappedBytes {
    map: Arc<Mmap>,
    range: Range<usize>,
}

impl Deref for MappedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map[self.range.clone()]
    }
}

impl AsRef<[u8]> for MappedBytes {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl MappedArtifact {
    /// Map `path` read-only. The file must not be modified while mapped;
    /// finalized artifacts are only ever replaced by rename.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ResidencyError::io_with_path(e, path))?;
        #[allow(unsafe_code)]
        // SAFETY: the file is opened read-only and finalized artifacts are
        // written once then renamed into place, never modified in place.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| ResidencyError::io_with_path(e, path))?;
        let len = map.len() as u64;
        debug!(path = %path.display(), bytes = len, "Mapped artifact");
        Ok(Self {
            path: path.to_path_buf(),
            len,
            map: RwLock::new(Some(Arc::new(map))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn mapping(&self) -> Result<Arc<Mmap>> {
        self.map
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                ResidencyError::InvalidState(format!("{} has been disposed", self.path.display()))
            })
    }

    /// The whole artifact.
    pub fn as_bytes(&self) -> Result<MappedBytes> {
        let map = self.mapping()?;
        let range = 0..map.len();
        Ok(MappedBytes { map, range })
    }

    /// Chunk `index` of a `chunk_size` split; the last chunk may be short.
    pub fn chunk(&self, index: u64, chunk_size: u64) -> Result<MappedBytes> {
        if chunk_size == 0 {
            return Err(ResidencyError::Validation {
                field: "chunk_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        let start = index.saturating_mul(chunk_size);
        if start >= self.len {
            return Err(ResidencyError::InvalidChunk {
                index,
                message: format!("beyond end of {}-byte artifact", self.len),
            });
        }
        let end = start.saturating_add(chunk_size).min(self.len);
        let map = self.mapping()?;
        Ok(MappedBytes {
            map,
            range: start as usize..end as usize,
        })
    }

    /// Check the mapped bytes against an expected digest.
    pub fn verify(&self, expected: &Checksum) -> Result<()> {
        let bytes = self.as_bytes()?;
        expected.verify(&self.path.display().to_string(), &bytes)
    }
}

impl Disposable for MappedArtifact {
    fn dispose(&self) {
        let released = self
            .map
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if released.is_some() {
            debug!(path = %self.path.display(), "Released artifact mapping");
        }
    }
}

impl ModelHandle for MappedArtifact {
    fn memory_footprint(&self) -> u64 {
        self.len
    }
}
