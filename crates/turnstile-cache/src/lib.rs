//! Tiered caching for the redirect resolver.
//!
//! The cache is built from three parts: a strict-LRU in-process first
//! tier with per-entry TTLs ([`LruTier`]), an optional shared second
//! tier behind the [`TierStore`] trait (Redis via [`RedisTier`]), and
//! a bloom-filter [`NegativeFilter`] that short-circuits second-tier
//! lookups for keys that were never cached. [`TieredCache`] composes
//! them and adds per-key single-flight `remember` semantics, so a
//! stampede of concurrent misses for one key costs a single trip to
//! the backing source.

pub mod error;
pub mod lru;
pub mod negative;
pub mod tier;
pub mod tiered;

pub use error::{CacheError, Result};
pub use lru::{LruStats, LruTier};
pub use negative::{NegativeFilter, NegativeFilterConfig};
pub use tier::{RedisTier, TierStore};
pub use tiered::{Lookup, TieredCache, TieredCacheConfig, TieredStats};
