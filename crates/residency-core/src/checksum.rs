//! Content checksums for chunks and assembled artifacts.
//!
//! Checksums are written as `sha256:<hex>` or `blake3:<hex>`; a bare hex
//! string is taken to be SHA256. Files are hashed in a single streaming pass.

use crate::error::{ResidencyError, Result};
use blake3::Hasher as Blake3Hasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Read buffer size for file hashing (8MB).
const HASH_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Blake3,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }
}

/// An expected or computed digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase hex digest.
    pub hex: String,
}

impl Checksum {
    /// Compute a checksum over an in-memory buffer.
    pub fn compute(algorithm: ChecksumAlgorithm, bytes: &[u8]) -> Self {
        let mut hasher = StreamingHasher::new(algorithm);
        hasher.update(bytes);
        hasher.finalize()
    }

    /// SHA256 of a buffer; the default chunk checksum.
    pub fn sha256(bytes: &[u8]) -> Self {
        Self::compute(ChecksumAlgorithm::Sha256, bytes)
    }

    /// Hash a file in one streaming pass.
    pub fn of_file(algorithm: ChecksumAlgorithm, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file =
            std::fs::File::open(path).map_err(|e| ResidencyError::io_with_path(e, path))?;

        let mut hasher = StreamingHasher::new(algorithm);
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let bytes_read = file
                .read(&mut buffer)
                .map_err(|e| ResidencyError::io_with_path(e, path))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(hasher.finalize())
    }

    /// Check `bytes` against this checksum.
    pub fn verify(&self, scope: &str, bytes: &[u8]) -> Result<()> {
        let actual = Self::compute(self.algorithm, bytes);
        self.expect_eq(scope, &actual)
    }

    /// Compare against a computed checksum, producing a typed mismatch error.
    pub fn expect_eq(&self, scope: &str, actual: &Checksum) -> Result<()> {
        if self == actual {
            Ok(())
        } else {
            Err(ResidencyError::ChecksumMismatch {
                scope: scope.to_string(),
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for Checksum {
    type Err = ResidencyError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex_part) = match s.split_once(':') {
            Some(("sha256", rest)) => (ChecksumAlgorithm::Sha256, rest),
            Some(("blake3", rest)) => (ChecksumAlgorithm::Blake3, rest),
            Some((other, _)) => {
                return Err(ResidencyError::Validation {
                    field: "checksum".to_string(),
                    message: format!("unsupported algorithm {:?}", other),
                })
            }
            None => (ChecksumAlgorithm::Sha256, s),
        };

        let hex_part = hex_part.trim().to_ascii_lowercase();
        let decoded = hex::decode(&hex_part).map_err(|e| ResidencyError::Validation {
            field: "checksum".to_string(),
            message: format!("invalid hex digest: {}", e),
        })?;
        if decoded.len() != 32 {
            return Err(ResidencyError::Validation {
                field: "checksum".to_string(),
                message: format!("expected a 32-byte digest, got {} bytes", decoded.len()),
            });
        }

        Ok(Self {
            algorithm,
            hex: hex_part,
        })
    }
}

impl TryFrom<String> for Checksum {
    type Error = ResidencyError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}

/// Incremental hasher used when an artifact is assembled chunk by chunk.
pub enum StreamingHasher {
    Sha256(Sha256),
    Blake3(Box<Blake3Hasher>),
}

impl StreamingHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => StreamingHasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Blake3 => StreamingHasher::Blake3(Box::new(Blake3Hasher::new())),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            StreamingHasher::Sha256(h) => h.update(bytes),
            StreamingHasher::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    pub fn finalize(self) -> Checksum {
        match self {
            StreamingHasher::Sha256(h) => Checksum {
                algorithm: ChecksumAlgorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            StreamingHasher::Blake3(h) => Checksum {
                algorithm: ChecksumAlgorithm::Blake3,
                hex: h.finalize().to_hex().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_known_value() {
        let checksum = Checksum::sha256(b"hello");
        assert_eq!(checksum.hex, HELLO_SHA256);
        assert_eq!(checksum.to_string(), format!("sha256:{}", HELLO_SHA256));
    }

    #[test]
    fn test_parse_bare_hex_defaults_to_sha256() {
        let parsed: Checksum = HELLO_SHA256.parse().unwrap();
        assert_eq!(parsed.algorithm, ChecksumAlgorithm::Sha256);
        assert!(parsed.verify("hello", b"hello").is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("md5:abcd".parse::<Checksum>().is_err());
        assert!("sha256:zz".parse::<Checksum>().is_err());
        assert!("sha256:abcd".parse::<Checksum>().is_err());
    }

    #[test]
    fn test_verify_mismatch_is_typed() {
        let checksum = Checksum::sha256(b"hello");
        let err = checksum.verify("chunk 0", b"hellp").unwrap_err();
        assert!(matches!(err, ResidencyError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_file_hash_matches_buffer_hash() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("artifact.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        for algorithm in [ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Blake3] {
            let from_file = Checksum::of_file(algorithm, &path).unwrap();
            assert_eq!(from_file, Checksum::compute(algorithm, &data));
        }
    }

    #[test]
    fn test_serde_uses_prefixed_string() {
        let checksum = Checksum::compute(ChecksumAlgorithm::Blake3, b"abc");
        let json = serde_json::to_string(&checksum).unwrap();
        assert!(json.starts_with("\"blake3:"));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checksum);
    }
}
