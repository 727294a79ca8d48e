//! Tiered caching: a byte-bounded memory tier over a durable secondary tier.

mod index;
mod lru;
mod tiered;
mod types;

pub use index::{IndexRecord, RecoveryReport, INDEX_FORMAT_VERSION};
pub use lru::LruTier;
pub use tiered::TieredCache;
pub use types::{CacheEntry, CacheStats, CacheValue, SweepReport, Tier};
