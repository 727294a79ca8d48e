//! Error types for the residency manager.
//!
//! Every component returns these typed errors instead of panicking or
//! signalling "not found" / "over budget" through control flow.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the residency manager.
#[derive(Debug, Error)]
pub enum ResidencyError {
    // Capacity errors
    #[error("Memory budget exhausted: need {required} bytes, {available} available")]
    ResourceExhausted { required: u64, available: u64 },

    // Integrity errors
    #[error("Checksum mismatch for {scope}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// What was being verified (e.g. "chunk 3" or an artifact path).
        scope: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid chunk {index}: {message}")]
    InvalidChunk { index: u64, message: String },

    #[error("Chunk {index} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        index: u64,
        attempts: u32,
        message: String,
    },

    // Component graph errors
    #[error("Cannot unload {component}: still required by {}", dependents.join(", "))]
    DependencyViolation {
        component: String,
        dependents: Vec<String>,
    },

    // Lifecycle errors
    #[error("Failed to construct {name}: {message}")]
    ConstructionFailure { name: String, message: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    // Storage errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for residency operations.
pub type Result<T> = std::result::Result<T, ResidencyError>;

impl From<std::io::Error> for ResidencyError {
    fn from(err: std::io::Error) -> Self {
        ResidencyError::Storage {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ResidencyError {
    fn from(err: serde_json::Error) -> Self {
        ResidencyError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ResidencyError {
    /// Create a storage error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ResidencyError::Storage {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a storage error from a message and path.
    pub fn storage(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        ResidencyError::Storage {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Check if this error should be retried locally before escalating.
    ///
    /// Capacity and dependency violations are never retried: the caller has to
    /// change its request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResidencyError::Storage { .. }
                | ResidencyError::Timeout(_)
                | ResidencyError::ChecksumMismatch { .. }
        )
    }

    /// Short machine-readable category name, used in logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            ResidencyError::ResourceExhausted { .. } => "resource_exhausted",
            ResidencyError::ChecksumMismatch { .. } => "checksum_mismatch",
            ResidencyError::InvalidChunk { .. } => "invalid_chunk",
            ResidencyError::RetriesExhausted { .. } => "retries_exhausted",
            ResidencyError::DependencyViolation { .. } => "dependency_violation",
            ResidencyError::ConstructionFailure { .. } => "construction_failure",
            ResidencyError::Timeout(_) => "timeout",
            ResidencyError::Cancelled => "cancelled",
            ResidencyError::Storage { .. } => "storage_failure",
            ResidencyError::Json { .. } => "json",
            ResidencyError::NotFound(_) => "not_found",
            ResidencyError::Config { .. } => "config",
            ResidencyError::Validation { .. } => "validation",
            ResidencyError::InvalidState(_) => "invalid_state",
            ResidencyError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ResidencyError::DependencyViolation {
            component: "embed".into(),
            dependents: vec!["attn.0".into(), "attn.1".into()],
        };
        assert_eq!(
            err.to_string(),
            "Cannot unload embed: still required by attn.0, attn.1"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ResidencyError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(ResidencyError::storage("disk full", "/tmp/x").is_retryable());
        assert!(!ResidencyError::ResourceExhausted {
            required: 10,
            available: 1
        }
        .is_retryable());
        assert!(!ResidencyError::DependencyViolation {
            component: "a".into(),
            dependents: vec!["b".into()],
        }
        .is_retryable());
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ResidencyError::io_with_path(io, "/data/chunk_0001.part");
        assert_eq!(err.kind(), "storage_failure");
        assert!(std::error::Error::source(&err).is_some());
    }
}
