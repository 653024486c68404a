//! Bloom-filter negative markers for fast "definitely never cached"
//! answers.
//!
//! The filter records every key that has ever been cached. On a
//! first-tier miss it is consulted before the shared second tier: if
//! the filter says the key was never cached, the lookup is answered
//! as a miss without the network round-trip. The filter is
//! conservative: false positives only cost an extra tier lookup,
//! false negatives cannot happen.
//!
//! Standard Bloom filters do not support deletion, so markers are
//! never removed individually; [`NegativeFilter::clear`] rebuilds the
//! whole filter.

use crate::error::{CacheError, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use typed_builder::TypedBuilder;

/// Sizing parameters for the filter.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NegativeFilterConfig {
    /// Expected number of distinct keys the cache will see. Setting
    /// this too low raises the false positive rate.
    #[builder(default = 100_000)]
    pub expected_items: usize,

    /// Desired false positive probability between 0.0 and 1.0.
    #[builder(default = 0.01)]
    pub false_positive_rate: f64,
}

impl Default for NegativeFilterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Probabilistic record of every key ever cached.
pub struct NegativeFilter {
    bloom: RwLock<bloomfilter::Bloom<String>>,
    config: NegativeFilterConfig,
    marked: AtomicU64,
}

impl NegativeFilter {
    /// # Errors
    ///
    /// Returns `CacheError::Initialization` if the filter cannot be
    /// sized for the requested parameters.
    pub fn new(config: NegativeFilterConfig) -> Result<Self> {
        let bloom = Self::build(&config)?;
        Ok(Self {
            bloom: RwLock::new(bloom),
            config,
            marked: AtomicU64::new(0),
        })
    }

    fn build(config: &NegativeFilterConfig) -> Result<bloomfilter::Bloom<String>> {
        bloomfilter::Bloom::new_for_fp_rate(config.expected_items, config.false_positive_rate)
            .map_err(|e| CacheError::Initialization(e.to_string()))
    }

    /// Records that `key` has been cached.
    pub fn mark(&self, key: &str) {
        let key = key.to_owned();
        self.bloom.write().set(&key);
        self.marked.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `false` only if `key` was definitely never cached.
    pub fn maybe_contains(&self, key: &str) -> bool {
        let key = key.to_owned();
        self.bloom.read().check(&key)
    }

    /// Rebuilds the filter, forgetting every marker.
    pub fn clear(&self) -> Result<()> {
        let fresh = Self::build(&self.config)?;
        *self.bloom.write() = fresh;
        self.marked.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Number of `mark` calls since creation or the last clear.
    pub fn marked(&self) -> u64 {
        self.marked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> NegativeFilter {
        NegativeFilter::new(
            NegativeFilterConfig::builder()
                .expected_items(1_000)
                .false_positive_rate(0.01)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn unmarked_key_is_definitely_absent() {
        let f = filter();
        assert!(!f.maybe_contains("never-seen"));
    }

    #[test]
    fn marked_keys_are_never_reported_absent() {
        let f = filter();
        for i in 0..500 {
            f.mark(&format!("key-{}", i));
        }
        for i in 0..500 {
            assert!(f.maybe_contains(&format!("key-{}", i)));
        }
        assert_eq!(f.marked(), 500);
    }

    #[test]
    fn clear_forgets_markers() {
        let f = filter();
        f.mark("abc");
        assert!(f.maybe_contains("abc"));

        f.clear().unwrap();
        assert!(!f.maybe_contains("abc"));
        assert_eq!(f.marked(), 0);
    }
}
