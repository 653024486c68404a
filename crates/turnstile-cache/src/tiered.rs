use crate::error::Result;
use crate::lru::{LruStats, LruTier};
use crate::negative::{NegativeFilter, NegativeFilterConfig};
use crate::tier::TierStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use typed_builder::TypedBuilder;

/// Outcome of a tiered lookup.
///
/// A `Negative` hit means the key was looked up before and found
/// absent in the backing source; callers must not fall through to the
/// source again until the negative entry expires.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    Hit(V),
    Negative,
    Miss,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct TieredCacheConfig {
    /// First-tier entry capacity.
    #[builder(default = 10_000)]
    pub capacity: usize,

    /// TTL applied to cached values when the caller passes none.
    #[builder(default = Duration::from_secs(300))]
    pub default_ttl: Duration,

    /// TTL for cached absent-key results. Kept short so newly created
    /// keys become visible quickly.
    #[builder(default = Duration::from_secs(30))]
    pub negative_ttl: Duration,

    /// Expected distinct keys, for sizing the negative filter.
    #[builder(default = 100_000)]
    pub expected_items: usize,

    /// Negative-filter false positive rate.
    #[builder(default = 0.01)]
    pub false_positive_rate: f64,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Aggregated statistics across tiers.
#[derive(Debug, Clone, Serialize)]
pub struct TieredStats {
    pub l1: LruStats,
    pub l2_enabled: bool,
    pub negative_marked: u64,
}

/// A two-tier cache with negative-lookup protection and per-key
/// single-flight computation.
///
/// The first tier is a strict-LRU in-process cache; the optional
/// second tier is a shared store consulted only on first-tier misses,
/// with hits promoted back into the first tier. Values are stored as
/// `Option<V>` internally: `None` entries are negative results cached
/// with a short TTL so absent keys cannot be replayed against the
/// backing source on every request.
pub struct TieredCache<V> {
    l1: LruTier<Option<V>>,
    l2: Option<Arc<dyn TierStore<Option<V>>>>,
    negative: NegativeFilter,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    default_ttl: Duration,
    negative_ttl: Duration,
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: TieredCacheConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Builds a cache backed by a shared second tier.
    pub fn with_second_tier(
        config: TieredCacheConfig,
        tier: Arc<dyn TierStore<Option<V>>>,
    ) -> Result<Self> {
        Self::build(config, Some(tier))
    }

    fn build(
        config: TieredCacheConfig,
        l2: Option<Arc<dyn TierStore<Option<V>>>>,
    ) -> Result<Self> {
        let negative = NegativeFilter::new(
            NegativeFilterConfig::builder()
                .expected_items(config.expected_items)
                .false_positive_rate(config.false_positive_rate)
                .build(),
        )?;
        Ok(Self {
            l1: LruTier::new(config.capacity),
            l2,
            negative,
            flights: Mutex::new(HashMap::new()),
            default_ttl: config.default_ttl,
            negative_ttl: config.negative_ttl,
        })
    }

    /// Looks `key` up across both tiers.
    pub async fn get(&self, key: &str) -> Result<Lookup<V>> {
        if let Some(cached) = self.l1.get(key) {
            trace!(key, "first-tier hit");
            return Ok(Self::to_lookup(cached));
        }

        // A key the filter has never seen cannot be in the second
        // tier either; skip the round-trip.
        if !self.negative.maybe_contains(key) {
            trace!(key, "negative filter short-circuit");
            return Ok(Lookup::Miss);
        }

        if let Some(l2) = &self.l2 {
            match l2.get(key).await {
                Ok(Some(cached)) => {
                    debug!(key, "second-tier hit, promoting");
                    let ttl = if cached.is_some() {
                        self.default_ttl
                    } else {
                        self.negative_ttl
                    };
                    self.l1.set(key, cached.clone(), Some(ttl));
                    return Ok(Self::to_lookup(cached));
                }
                Ok(None) => {
                    trace!(key, "second-tier miss");
                }
                Err(e) => {
                    // A broken second tier degrades to a miss; the
                    // breaker-guarded source path takes over.
                    warn!(key, error = %e, "second-tier lookup failed");
                }
            }
        }

        Ok(Lookup::Miss)
    }

    /// Stores a value in both tiers and marks the key.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.store(key, Some(value), ttl).await
    }

    /// Caches the absence of `key` with the short negative TTL.
    pub async fn set_negative(&self, key: &str) -> Result<()> {
        self.store(key, None, self.negative_ttl).await
    }

    async fn store(&self, key: &str, value: Option<V>, ttl: Duration) -> Result<()> {
        self.l1.set(key, value.clone(), Some(ttl));
        self.negative.mark(key);

        if let Some(l2) = &self.l2 {
            // Write-through is best-effort: a broken second tier must
            // not fail a request that already has its value.
            if let Err(e) = l2.set(key, &value, Some(ttl)).await {
                warn!(key, error = %e, "second-tier write failed");
            }
        }
        Ok(())
    }

    /// Removes `key` from both tiers. The negative filter keeps its
    /// marker; the next lookup pays one extra tier check.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.l1.delete(key);
        if let Some(l2) = &self.l2 {
            l2.del(key).await?;
        }
        Ok(())
    }

    /// Returns `true` if either tier holds a live value for `key`.
    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(matches!(self.get(key).await?, Lookup::Hit(_)))
    }

    /// Batch lookup; results align with `keys`, negatives and misses
    /// both collapse to `None`.
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<V>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(match self.get(key).await? {
                Lookup::Hit(v) => Some(v),
                Lookup::Negative | Lookup::Miss => None,
            });
        }
        Ok(results)
    }

    /// Batch store with a shared TTL.
    pub async fn mset(&self, items: Vec<(String, V)>, ttl: Option<Duration>) -> Result<()> {
        for (key, value) in items {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Looks `key` up, computing and caching it on a miss.
    ///
    /// Concurrent callers for the same missing key coalesce: the first
    /// caller runs `compute` while the rest wait on a per-key lock and
    /// reuse the stored result. At most one computation is in flight
    /// per key; a waiter recomputes only if the winner's entry has
    /// already expired by the time the waiter acquires the lock.
    ///
    /// `compute` returning `Ok(None)` caches a negative entry; an
    /// error caches nothing, so the next caller retries.
    pub async fn remember<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<V>>> + Send,
    {
        match self.get(key).await? {
            Lookup::Hit(v) => return Ok(Some(v)),
            Lookup::Negative => return Ok(None),
            Lookup::Miss => {}
        }

        let flight = {
            let mut flights = self.flights.lock();
            Arc::clone(
                flights
                    .entry(key.to_owned())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        let result = self.remember_locked(key, ttl, compute, &flight).await;

        // Drop the registry entry once the burst has drained. Clones
        // are only handed out under the registry lock, so a count of
        // two (registry + ours) proves no waiter is left.
        {
            let mut flights = self.flights.lock();
            if Arc::strong_count(&flight) == 2 {
                flights.remove(key);
            }
        }

        result
    }

    async fn remember_locked<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
        flight: &Arc<tokio::sync::Mutex<()>>,
    ) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<V>>> + Send,
    {
        let _guard = flight.lock().await;

        // Whoever held the lock before us may have cached the value.
        match self.get(key).await? {
            Lookup::Hit(v) => return Ok(Some(v)),
            Lookup::Negative => return Ok(None),
            Lookup::Miss => {}
        }

        trace!(key, "cache miss, computing");
        match compute().await? {
            Some(value) => {
                self.set(key, value.clone(), ttl).await?;
                Ok(Some(value))
            }
            None => {
                debug!(key, "source reported key absent, caching negative entry");
                self.set_negative(key).await?;
                Ok(None)
            }
        }
    }

    /// Returns the first-tier value even if expired, without touching
    /// recency. Backs stale-serving when the source is down.
    pub fn get_stale(&self, key: &str) -> Option<V> {
        self.l1.get_stale(key).flatten()
    }

    /// Sweeps expired first-tier entries; returns the count removed.
    /// The second tier expires its own entries.
    pub fn gc(&self) -> usize {
        self.l1.gc()
    }

    /// Rebuilds the negative filter. Useful after bulk deletions have
    /// made its markers stale.
    pub fn reset_markers(&self) -> Result<()> {
        self.negative.clear()
    }

    pub fn stats(&self) -> TieredStats {
        TieredStats {
            l1: self.l1.stats(),
            l2_enabled: self.l2.is_some(),
            negative_marked: self.negative.marked(),
        }
    }

    fn to_lookup(cached: Option<V>) -> Lookup<V> {
        match cached {
            Some(v) => Lookup::Hit(v),
            None => Lookup::Negative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory [`TierStore`] fake that counts reads.
    #[derive(Default)]
    struct MapTier {
        items: Mutex<HashMap<String, Option<String>>>,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl TierStore<Option<String>> for MapTier {
        async fn get(&self, key: &str) -> Result<Option<Option<String>>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(self.items.lock().get(key).cloned())
        }

        async fn set(
            &self,
            key: &str,
            value: &Option<String>,
            _ttl: Option<Duration>,
        ) -> Result<()> {
            self.items.lock().insert(key.to_owned(), value.clone());
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<()> {
            self.items.lock().remove(key);
            Ok(())
        }
    }

    fn cache() -> TieredCache<String> {
        TieredCache::new(TieredCacheConfig::default()).unwrap()
    }

    fn small_cache(capacity: usize) -> TieredCache<String> {
        TieredCache::new(TieredCacheConfig::builder().capacity(capacity).build()).unwrap()
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = cache();
        cache.set("a", "one".to_string(), None).await.unwrap();

        assert_eq!(
            cache.get("a").await.unwrap(),
            Lookup::Hit("one".to_string())
        );
        assert!(cache.has("a").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_key_is_a_miss() {
        let cache = cache();
        assert_eq!(cache.get("nope").await.unwrap(), Lookup::Miss);
        assert!(!cache.has("nope").await.unwrap());
    }

    #[tokio::test]
    async fn negative_entry_round_trips() {
        let cache = cache();
        cache.set_negative("gone").await.unwrap();

        assert_eq!(cache.get("gone").await.unwrap(), Lookup::Negative);
        assert!(!cache.has("gone").await.unwrap());
    }

    #[tokio::test]
    async fn eviction_scenario_with_access_order() {
        let cache = small_cache(2);
        cache.set("a", "1".to_string(), None).await.unwrap();
        cache.set("b", "2".to_string(), None).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Lookup::Hit("1".to_string()));
        cache.set("c", "3".to_string(), None).await.unwrap();

        assert_eq!(cache.get("b").await.unwrap(), Lookup::Miss);
        assert_eq!(cache.get("a").await.unwrap(), Lookup::Hit("1".to_string()));
        assert_eq!(cache.get("c").await.unwrap(), Lookup::Hit("3".to_string()));
    }

    #[tokio::test]
    async fn remember_single_flight() {
        let cache = Arc::new(cache());
        let computes = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            handles.push(tokio::spawn(async move {
                cache
                    .remember("hot", None, || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        computes.fetch_add(1, Ordering::SeqCst);
                        Ok(Some("value".to_string()))
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result, Some("value".to_string()));
        }

        assert_eq!(
            computes.load(Ordering::SeqCst),
            1,
            "concurrent misses for one key must coalesce into one computation"
        );
    }

    #[tokio::test]
    async fn remember_different_keys_compute_independently() {
        let cache = Arc::new(cache());
        let computes = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for i in 0..5 {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            handles.push(tokio::spawn(async move {
                cache
                    .remember(&format!("key-{}", i), None, || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        Ok(Some(format!("value-{}", i)))
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(computes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn remember_caches_negative_results() {
        let cache = cache();
        let computes = AtomicUsize::new(0);

        let first = cache
            .remember("absent", None, || async {
                computes.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert_eq!(first, None);

        // The cached negative entry answers without recomputing.
        let second = cache
            .remember("absent", None, || async {
                computes.fetch_add(1, Ordering::SeqCst);
                Ok(Some("surprise".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(second, None);
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remember_error_caches_nothing() {
        let cache = cache();

        let err = cache
            .remember("flaky", None, || async {
                Err::<Option<String>, _>(CacheError::Source("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Source(_)));

        // The failure was not cached; the next caller computes.
        let ok = cache
            .remember("flaky", None, || async { Ok(Some("ok".to_string())) })
            .await
            .unwrap();
        assert_eq!(ok, Some("ok".to_string()));
    }

    #[tokio::test]
    async fn second_tier_hit_promotes_to_first() {
        let tier = Arc::new(MapTier::default());
        tier.items
            .lock()
            .insert("warm".to_string(), Some("value".to_string()));

        let cache: TieredCache<String> =
            TieredCache::with_second_tier(TieredCacheConfig::default(), tier.clone()).unwrap();
        // The filter must believe the key may exist; a prior set on
        // another node would have marked it. Simulate with a mark.
        cache.negative.mark("warm");

        assert_eq!(
            cache.get("warm").await.unwrap(),
            Lookup::Hit("value".to_string())
        );
        assert_eq!(tier.gets.load(Ordering::SeqCst), 1);

        // Promotion means the second read never leaves the process.
        assert_eq!(
            cache.get("warm").await.unwrap(),
            Lookup::Hit("value".to_string())
        );
        assert_eq!(tier.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_filter_skips_second_tier() {
        let tier = Arc::new(MapTier::default());
        let cache: TieredCache<String> =
            TieredCache::with_second_tier(TieredCacheConfig::default(), tier.clone()).unwrap();

        // Never-cached keys must not generate tier traffic.
        for i in 0..20 {
            assert_eq!(
                cache.get(&format!("unknown-{}", i)).await.unwrap(),
                Lookup::Miss
            );
        }
        assert_eq!(tier.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_writes_through_to_second_tier() {
        let tier = Arc::new(MapTier::default());
        let cache: TieredCache<String> =
            TieredCache::with_second_tier(TieredCacheConfig::default(), tier.clone()).unwrap();

        cache.set("a", "one".to_string(), None).await.unwrap();
        assert_eq!(
            tier.items.lock().get("a"),
            Some(&Some("one".to_string()))
        );

        cache.delete("a").await.unwrap();
        assert!(tier.items.lock().get("a").is_none());
        assert_eq!(cache.l1.get_stale("a"), None);
    }

    #[tokio::test]
    async fn get_stale_survives_expiry() {
        let cache = cache();
        cache
            .set("a", "one".to_string(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get_stale("a"), Some("one".to_string()));
    }

    #[tokio::test]
    async fn gc_and_stats() {
        let cache = cache();
        cache
            .set("a", "one".to_string(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.set("b", "two".to_string(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.gc(), 1);

        let stats = cache.stats();
        assert_eq!(stats.l1.size, 1);
        assert!(!stats.l2_enabled);
        assert_eq!(stats.negative_marked, 2);
    }

    #[tokio::test]
    async fn batch_variants() {
        let cache = cache();
        cache
            .mset(
                vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())],
                None,
            )
            .await
            .unwrap();

        let results = cache
            .mget(&["a".to_string(), "missing".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(
            results,
            vec![Some("1".to_string()), None, Some("2".to_string())]
        );
    }
}
