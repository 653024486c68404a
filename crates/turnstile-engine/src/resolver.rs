//! Cache-aside rule resolution with circuit protection.
//!
//! The resolver is the only place the request path may touch the
//! backing store, and only on a cache miss with the circuit closed.
//! Concurrent misses for one key coalesce through the cache's
//! single-flight `remember`; absent keys are cached negatively so
//! nonexistent codes cannot stampede the store. When the store is
//! down the resolver degrades: a stale cached rule is served if one
//! exists, otherwise the key reports not-found. It never errors.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use turnstile_breaker::CircuitBreaker;
use turnstile_cache::{CacheError, TieredCache};
use turnstile_core::{RouteKey, RouteRule, RuleStore};

/// Circuit name guarding the rule store.
pub const RULE_STORE_CIRCUIT: &str = "rule_store";

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(RouteRule),
    NotFound,
}

/// Resolves route keys to routing rules through the tiered cache.
pub struct ResolverService {
    store: Arc<dyn RuleStore>,
    cache: Arc<TieredCache<RouteRule>>,
    breaker: Arc<CircuitBreaker>,
    cache_ttl: Duration,
}

impl ResolverService {
    pub fn new(
        store: Arc<dyn RuleStore>,
        cache: Arc<TieredCache<RouteRule>>,
        breaker: Arc<CircuitBreaker>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            breaker,
            cache_ttl,
        }
    }

    /// Resolves `key`, reading through the cache and falling back to
    /// the breaker-guarded store only on a miss.
    pub async fn resolve(&self, key: &RouteKey) -> Resolution {
        // Captured up front: a read of an expired entry drops it from
        // the first tier, so by the time the store has failed the
        // stale value would already be gone.
        let stale = self.cache.get_stale(key.as_str());

        let result = self
            .cache
            .remember(key.as_str(), Some(self.cache_ttl), || {
                let store = Arc::clone(&self.store);
                let breaker = Arc::clone(&self.breaker);
                let key = key.clone();
                async move {
                    breaker
                        .execute(RULE_STORE_CIRCUIT, store.get_rule(&key))
                        .await
                        .map_err(|e| CacheError::Source(e.to_string()))
                }
            })
            .await;

        match result {
            Ok(Some(rule)) => {
                if rule.is_expired() {
                    debug!(key = %key, "rule has expired");
                    return Resolution::NotFound;
                }
                Resolution::Found(rule)
            }
            Ok(None) => Resolution::NotFound,
            Err(e) => {
                warn!(key = %key, error = %e, "rule lookup failed, degrading");
                match stale {
                    Some(rule) if !rule.is_expired() => {
                        warn!(key = %key, "serving stale cached rule");
                        Resolution::Found(rule)
                    }
                    _ => Resolution::NotFound,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jiff::{SignedDuration, Timestamp};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use turnstile_breaker::BreakerConfig;
    use turnstile_cache::TieredCacheConfig;
    use turnstile_core::StoreError;

    /// Store fake with call counting and switchable failure.
    #[derive(Default)]
    struct CountingStore {
        rule: parking_lot::Mutex<Option<RouteRule>>,
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingStore {
        fn with_rule(rule: RouteRule) -> Self {
            Self {
                rule: parking_lot::Mutex::new(Some(rule)),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RuleStore for CountingStore {
        async fn get_rule(&self, _key: &RouteKey) -> Result<Option<RouteRule>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("db down".to_string()));
            }
            Ok(self.rule.lock().clone())
        }
    }

    fn rule(id: i64, expire_at: Option<Timestamp>) -> RouteRule {
        RouteRule {
            rule_id: id,
            target_url: "https://example.com".to_string(),
            expire_at,
        }
    }

    fn resolver(store: Arc<CountingStore>, cache_ttl: Duration) -> ResolverService {
        let cache = Arc::new(
            TieredCache::new(
                TieredCacheConfig::builder()
                    .negative_ttl(Duration::from_secs(30))
                    .build(),
            )
            .unwrap(),
        );
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::builder()
                .failure_threshold(2)
                .cooldown(Duration::from_secs(30))
                .call_timeout(Duration::from_millis(200))
                .build(),
        ));
        ResolverService::new(store, cache, breaker, cache_ttl)
    }

    fn key(s: &str) -> RouteKey {
        RouteKey::new_unchecked(s)
    }

    #[tokio::test]
    async fn cache_aside_hits_store_once() {
        let store = Arc::new(CountingStore::with_rule(rule(1, None)));
        let resolver = resolver(Arc::clone(&store), Duration::from_secs(60));

        for _ in 0..5 {
            let resolution = resolver.resolve(&key("abc")).await;
            assert!(matches!(resolution, Resolution::Found(ref r) if r.rule_id == 1));
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn absent_key_is_cached_negatively() {
        let store = Arc::new(CountingStore::default());
        let resolver = resolver(Arc::clone(&store), Duration::from_secs(60));

        for _ in 0..5 {
            assert_eq!(resolver.resolve(&key("ghost")).await, Resolution::NotFound);
        }
        // One miss reached the store; the rest hit the negative entry.
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_rule_is_not_found() {
        let past = Timestamp::now() - SignedDuration::from_secs(1);
        let store = Arc::new(CountingStore::with_rule(rule(1, Some(past))));
        let resolver = resolver(store, Duration::from_secs(60));

        assert_eq!(resolver.resolve(&key("old")).await, Resolution::NotFound);
    }

    #[tokio::test]
    async fn store_failure_serves_stale_rule() {
        let store = Arc::new(CountingStore::with_rule(rule(1, None)));
        // Tiny TTL so the cached entry expires quickly.
        let resolver = resolver(Arc::clone(&store), Duration::from_millis(20));

        assert!(matches!(
            resolver.resolve(&key("abc")).await,
            Resolution::Found(_)
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.fail.store(true, Ordering::SeqCst);

        // Entry expired, store down: the stale value still serves.
        assert!(matches!(
            resolver.resolve(&key("abc")).await,
            Resolution::Found(ref r) if r.rule_id == 1
        ));
    }

    #[tokio::test]
    async fn store_failure_without_cache_degrades_to_not_found() {
        let store = Arc::new(CountingStore::default());
        store.fail.store(true, Ordering::SeqCst);
        let resolver = resolver(store, Duration::from_secs(60));

        assert_eq!(resolver.resolve(&key("abc")).await, Resolution::NotFound);
    }

    #[tokio::test]
    async fn open_circuit_stops_store_traffic() {
        let store = Arc::new(CountingStore::default());
        store.fail.store(true, Ordering::SeqCst);
        let resolver = resolver(Arc::clone(&store), Duration::from_secs(60));

        // Two failures trip the breaker (threshold 2).
        resolver.resolve(&key("a")).await;
        resolver.resolve(&key("b")).await;
        let calls_when_tripped = store.calls.load(Ordering::SeqCst);

        // Further misses fail fast without touching the store.
        for i in 0..5 {
            resolver.resolve(&key(&format!("k{}", i))).await;
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), calls_when_tripped);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce() {
        let store = Arc::new(CountingStore::with_rule(rule(1, None)));
        let resolver = Arc::new(resolver(Arc::clone(&store), Duration::from_secs(60)));

        let mut handles = vec![];
        for _ in 0..10 {
            let resolver = Arc::clone(&resolver);
            handles.push(tokio::spawn(async move {
                resolver.resolve(&key("hot")).await
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Resolution::Found(_)
            ));
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
