//! Cache value trait, entries and statistics.

use crate::error::{ResidencyError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A value the tiered cache can hold.
///
/// Values must be cheap to clone (hand out `Bytes`/`Arc`s rather than deep
/// copies) and able to round-trip through the secondary tier.
pub trait CacheValue: Clone + Send + Sync + 'static {
    /// Serialize for the secondary tier.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Deserialize a value read back from the secondary tier.
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Fallback size estimate used when `put` is not given a size.
    fn estimated_size(&self) -> u64;
}

impl CacheValue for Bytes {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn estimated_size(&self) -> u64 {
        self.len() as u64
    }
}

impl CacheValue for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }

    fn estimated_size(&self) -> u64 {
        self.len() as u64
    }
}

impl CacheValue for String {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|e| ResidencyError::Validation {
            field: "value".to_string(),
            message: format!("secondary entry is not UTF-8: {}", e),
        })
    }

    fn estimated_size(&self) -> u64 {
        self.len() as u64
    }
}

/// A cached entry with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    /// Accounted size in bytes.
    pub size_bytes: u64,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Recency tick; higher is more recent.
    pub(crate) tick: u64,
}

/// Which tier served or holds an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Memory,
    Secondary,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub secondary_hits: u64,
    pub misses: u64,
    /// Entries pushed out of a tier to make room (demotions plus destructive
    /// secondary evictions).
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
    /// Durable writes/reads that failed and were degraded to "not persisted".
    pub storage_failures: u64,
    pub memory_entries: usize,
    pub memory_tier_bytes: u64,
    pub memory_budget_bytes: u64,
    pub secondary_entries: usize,
    pub secondary_tier_bytes: u64,
    pub secondary_budget_bytes: u64,
}

impl CacheStats {
    /// Fraction of lookups served from either tier.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.secondary_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// What a background sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub system_usage_fraction: f64,
    pub memory_entries_evicted: usize,
    pub memory_bytes_freed: u64,
    pub secondary_entries_purged: usize,
    pub secondary_bytes_freed: u64,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.memory_entries_evicted == 0 && self.secondary_entries_purged == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_value_round_trip_and_size() {
        let value = Bytes::from_static(b"weights");
        assert_eq!(value.estimated_size(), 7);
        let decoded = Bytes::decode(&value.encode().unwrap()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_string_decode_rejects_invalid_utf8() {
        assert!(String::decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            memory_hits: 3,
            secondary_hits: 1,
            misses: 4,
            ..CacheStats::default()
        };
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
