//! End-to-end flows through the composed engine: admission, cached
//! resolution, write-behind draining, and degradation under store
//! failure.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use turnstile_core::{
    CoreConfig, MemoryStore, RawRangeRule, RequestContext, RouteKey, RouteRule, RuleStore,
    StoreError,
};
use turnstile_engine::{Decision, DenyReason, Engine, Resolution};

const BROWSER_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

fn config() -> CoreConfig {
    CoreConfig {
        rate_limit_max: 100,
        rate_limit_global_max: 1_000_000,
        ..CoreConfig::default()
    }
}

fn ctx(ip: &str) -> RequestContext {
    RequestContext::builder()
        .visitor_ip(ip)
        .user_agent(BROWSER_UA)
        .path("/r/abc123")
        .headers_present(vec![
            "accept".into(),
            "accept-language".into(),
            "accept-encoding".into(),
        ])
        .build()
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.put_rule(
        &RouteKey::new_unchecked("abc123"),
        RouteRule {
            rule_id: 42,
            target_url: "https://example.com/landing".to_string(),
            expire_at: None,
        },
    );
    store
}

async fn engine_over(store: Arc<MemoryStore>) -> Engine {
    let engine = Engine::new(&config(), store.clone(), store).unwrap();
    engine.warm_up().await;
    engine
}

#[tokio::test]
async fn allowed_request_resolves_and_records_the_access() {
    let store = seeded_store();
    let engine = engine_over(Arc::clone(&store)).await;

    let ctx = ctx("203.0.113.9");
    let decision = engine.admit(&ctx).await;
    assert!(decision.allowed);

    let key = RouteKey::new("abc123").unwrap();
    match engine.resolve(&ctx, &key).await {
        Resolution::Found(rule) => {
            assert_eq!(rule.target_url, "https://example.com/landing")
        }
        Resolution::NotFound => panic!("seeded rule should resolve"),
    }

    // Nothing hits the store until the drain runs.
    assert_eq!(store.recorded_accesses().len(), 0);
    assert_eq!(store.clicks_for(42), 0);

    let drain = engine.spawn_drain_worker(store.clone());
    drain.shutdown().await;

    assert_eq!(store.recorded_accesses().len(), 1);
    assert_eq!(store.recorded_accesses()[0].rule_id, 42);
    assert_eq!(store.clicks_for(42), 1);
}

#[tokio::test]
async fn unknown_key_resolves_not_found() {
    let store = seeded_store();
    let engine = engine_over(store).await;

    let ctx = ctx("203.0.113.9");
    let key = RouteKey::new("missing").unwrap();
    assert_eq!(engine.resolve(&ctx, &key).await, Resolution::NotFound);
}

#[tokio::test]
async fn blacklisted_ip_is_denied_and_the_hit_is_drained() {
    let store = seeded_store();
    store.put_ranges(vec![RawRangeRule {
        rule_id: 7,
        cidr: "203.0.113.0/24".to_string(),
        kind: "custom".to_string(),
        category: "manual".to_string(),
        name: "banned-range".to_string(),
        enabled: true,
    }]);
    let engine = engine_over(Arc::clone(&store)).await;

    let decision = engine.admit(&ctx("203.0.113.9")).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenyReason::Blacklisted));

    let drain = engine.spawn_drain_worker(store.clone());
    drain.shutdown().await;

    assert_eq!(store.range_hits_for(7), 1);
    assert_eq!(store.recorded_blocks().len(), 1);
    assert_eq!(store.recorded_blocks()[0].reason, "blacklisted");
}

#[tokio::test]
async fn honeypot_probe_lands_in_the_store_blacklist() {
    let store = seeded_store();
    let engine = engine_over(Arc::clone(&store)).await;

    let mut probe = ctx("198.51.100.66");
    probe.path = "/wp-login.php".to_string();
    let decision = engine.admit(&probe).await;
    assert_eq!(decision.reason, Some(DenyReason::Honeypot));

    let drain = engine.spawn_drain_worker(store.clone());
    drain.shutdown().await;

    let entries = store.blacklist_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "198.51.100.66/32");
    assert!(entries[0].1.contains("honeypot"));
}

#[tokio::test]
async fn rate_limit_end_to_end() {
    let store = seeded_store();
    let config = CoreConfig {
        rate_limit_max: 3,
        rate_limit_global_max: 1_000_000,
        ..CoreConfig::default()
    };
    let engine = Engine::new(&config, store.clone(), store).unwrap();
    engine.warm_up().await;

    for i in 0..3 {
        let decision = engine.admit(&ctx("203.0.113.9")).await;
        assert!(decision.allowed, "request {} should pass", i + 1);
    }

    let fourth = engine.admit(&ctx("203.0.113.9")).await;
    assert!(!fourth.allowed);
    assert_eq!(fourth.reason, Some(DenyReason::RateLimited));
    assert!(fourth.retry_after.unwrap() > Duration::ZERO);
}

#[tokio::test]
async fn store_outage_degrades_without_errors() {
    /// A rule store that always fails.
    struct DownStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RuleStore for DownStore {
        async fn get_rule(&self, _key: &RouteKey) -> Result<Option<RouteRule>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Backend("db down".to_string()))
        }
    }

    let ranges = Arc::new(MemoryStore::new());
    let down = Arc::new(DownStore {
        calls: AtomicUsize::new(0),
    });
    let config = CoreConfig {
        breaker_failure_threshold: 2,
        ..CoreConfig::default()
    };
    let engine = Engine::new(&config, down.clone(), ranges).unwrap();

    let ctx = ctx("203.0.113.9");

    // Every resolve degrades to NotFound; none panics or errors.
    for i in 0..6 {
        let key = RouteKey::new_unchecked(format!("k{}", i));
        assert_eq!(engine.resolve(&ctx, &key).await, Resolution::NotFound);
    }

    // The breaker tripped after two failures and stopped the traffic.
    assert_eq!(down.calls.load(Ordering::SeqCst), 2);
    let stats = engine.stats();
    let breaker = &stats.breakers["rule_store"];
    assert_eq!(breaker.failure_count, 2);
}

#[tokio::test]
async fn stats_aggregate_every_component() {
    let store = seeded_store();
    let engine = engine_over(Arc::clone(&store)).await;

    let ctx = ctx("203.0.113.9");
    engine.admit(&ctx).await;
    engine
        .resolve(&ctx, &RouteKey::new_unchecked("abc123"))
        .await;

    let stats = engine.stats();
    assert_eq!(stats.matcher.rules, 0);
    assert!(stats.queues.contains_key("access_log"));
    assert_eq!(stats.limiter.client_max, 100);

    // The whole report serialises for a metrics endpoint.
    let json = serde_json::to_value(&stats).unwrap();
    assert!(json["cache"]["l1"]["capacity"].is_number());
}

#[tokio::test]
async fn admission_decision_is_always_produced() {
    // Even a hostile, malformed request gets a decision, never a
    // panic or an error.
    let store = seeded_store();
    let engine = engine_over(store).await;

    let weird = RequestContext::builder()
        .visitor_ip("not-an-ip-at-all")
        .user_agent("\u{0}\u{1}")
        .path("/../../etc/passwd")
        .build();

    let decision: Decision = engine.admit(&weird).await;
    assert!(!decision.allowed);
    assert!(decision.reason.is_some());
}
