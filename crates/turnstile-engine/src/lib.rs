//! The composed resolution core: admission pipeline, tiered cache,
//! rate limiter, circuit breaker, range matcher, and write-behind
//! queue behind one explicitly constructed [`Engine`].
//!
//! The serving layer builds an `Engine` at process start, spawns its
//! maintenance and drain tasks, and calls [`Engine::admit`] /
//! [`Engine::resolve`] per request. Nothing in here opens a listener
//! or renders a response; the core decides, the serving layer acts.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use turnstile_core::{CoreConfig, MemoryStore, RequestContext, RouteKey};
//! use turnstile_engine::Engine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let config = CoreConfig::default();
//! let engine = Engine::new(&config, store.clone(), store.clone())?;
//! engine.warm_up().await;
//! let _maintenance = engine.spawn_maintenance();
//! let _drain = engine.spawn_drain_worker(store);
//!
//! let ctx = RequestContext::builder()
//!     .visitor_ip("203.0.113.9")
//!     .build();
//! let decision = engine.admit(&ctx).await;
//! if decision.allowed {
//!     let key = RouteKey::new("abc123")?;
//!     let _resolution = engine.resolve(&ctx, &key).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod heuristics;
pub mod pipeline;
pub mod resolver;

pub use error::{EngineError, Result};
pub use pipeline::{AdmissionConfig, AdmissionPipeline, BlockAction, Decision, DenyReason, PipelineStats};
pub use resolver::{Resolution, ResolverService, RULE_STORE_CIRCUIT};

use jiff::Timestamp;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use turnstile_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use turnstile_cache::{TierStore, TieredCache, TieredCacheConfig, TieredStats};
use turnstile_core::{
    AccessEvent, CoreConfig, RangeRuleSource, RequestContext, RouteKey, RouteRule, RuleStore,
    EventSink,
};
use turnstile_limiter::{LimiterStats, RateLimiter, RateLimiterConfig};
use turnstile_matcher::{IntervalMatcher, MatcherStats};
use turnstile_queue::{
    topics, ClickSync, DrainTask, DrainWorker, QueueStats, WriteBehindQueue,
};

/// Aggregated health/metrics view across every component.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub cache: TieredStats,
    pub limiter: LimiterStats,
    pub breakers: HashMap<String, BreakerSnapshot>,
    pub queues: HashMap<String, QueueStats>,
    pub matcher: MatcherStats,
    pub admission: PipelineStats,
}

/// The composed core. One instance per process, owned by the entry
/// point and shared with request handlers.
pub struct Engine {
    cache: Arc<TieredCache<RouteRule>>,
    matcher: Arc<IntervalMatcher>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<WriteBehindQueue>,
    pipeline: AdmissionPipeline,
    resolver: ResolverService,
    queue_batch_size: usize,
    maintenance_interval: Duration,
}

impl Engine {
    /// Builds an engine with default admission policy and no shared
    /// cache tier.
    pub fn new(
        config: &CoreConfig,
        rule_store: Arc<dyn RuleStore>,
        range_source: Arc<dyn RangeRuleSource>,
    ) -> Result<Self> {
        Self::with_options(
            config,
            rule_store,
            range_source,
            AdmissionConfig::default(),
            None,
        )
    }

    /// Builds an engine with an explicit admission policy and an
    /// optional shared second cache tier.
    ///
    /// The timing knobs shared with [`CoreConfig`] (temp-block
    /// duration, auto-blacklist window and threshold) are taken from
    /// `config`, overriding whatever `admission` carries.
    pub fn with_options(
        config: &CoreConfig,
        rule_store: Arc<dyn RuleStore>,
        range_source: Arc<dyn RangeRuleSource>,
        mut admission: AdmissionConfig,
        second_tier: Option<Arc<dyn TierStore<Option<RouteRule>>>>,
    ) -> Result<Self> {
        let cache_config = TieredCacheConfig::builder()
            .capacity(config.cache_capacity)
            .default_ttl(Duration::from_secs(config.cache_ttl_seconds))
            .negative_ttl(Duration::from_secs(config.negative_ttl_seconds))
            .build();
        let cache = Arc::new(match second_tier {
            Some(tier) => TieredCache::with_second_tier(cache_config, tier)?,
            None => TieredCache::new(cache_config)?,
        });

        let matcher = Arc::new(IntervalMatcher::new(
            range_source,
            Duration::from_secs(config.blacklist_refresh_ttl),
            Duration::from_secs(config.blacklist_poll_seconds),
        ));

        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig::builder()
                .window(Duration::from_secs(config.rate_limit_window))
                .client_max(config.rate_limit_max)
                .global_max(config.rate_limit_global_max)
                .build(),
        ));

        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::builder()
                .failure_threshold(config.breaker_failure_threshold)
                .cooldown(Duration::from_secs(config.breaker_cooldown_seconds))
                .call_timeout(Duration::from_millis(config.store_timeout_ms))
                .build(),
        ));

        let queue = Arc::new(WriteBehindQueue::new(config.queue_max_retries));

        admission.temp_block = Duration::from_secs(config.temp_block_seconds);
        admission.auto_blacklist_max = config.auto_blacklist_max_blocks;
        admission.auto_blacklist_window = Duration::from_secs(config.auto_blacklist_window);

        let pipeline = AdmissionPipeline::new(
            admission,
            Arc::clone(&matcher),
            Arc::clone(&limiter),
            Arc::clone(&queue),
        );

        let resolver = ResolverService::new(
            rule_store,
            Arc::clone(&cache),
            Arc::clone(&breaker),
            Duration::from_secs(config.cache_ttl_seconds),
        );

        Ok(Self {
            cache,
            matcher,
            limiter,
            breaker,
            queue,
            pipeline,
            resolver,
            queue_batch_size: config.queue_batch_size,
            maintenance_interval: Duration::from_secs(config.blacklist_poll_seconds.max(1)),
        })
    }

    /// Loads the first range snapshot. Call once at startup; a failed
    /// load logs and leaves the matcher empty until maintenance
    /// succeeds.
    pub async fn warm_up(&self) {
        if let Err(e) = self.matcher.load().await {
            warn!(error = %e, "initial range snapshot load failed");
        }
    }

    /// Runs the admission chain for one request.
    pub async fn admit(&self, ctx: &RequestContext) -> Decision {
        self.pipeline.admit(ctx)
    }

    /// Resolves a route key and records the access asynchronously.
    ///
    /// A found rule enqueues the access-log row and a click increment;
    /// both are fire-and-forget and cannot fail the request.
    pub async fn resolve(&self, ctx: &RequestContext, key: &RouteKey) -> Resolution {
        let resolution = self.resolver.resolve(key).await;

        if let Resolution::Found(rule) = &resolution {
            self.queue.push_event(
                topics::ACCESS_LOG,
                &AccessEvent {
                    rule_id: rule.rule_id,
                    visitor_ip: ctx.visitor_ip.clone(),
                    user_agent: ctx.user_agent.clone(),
                    referer: ctx.referer.clone(),
                    at: Timestamp::now(),
                },
            );
            self.queue.push_event(
                topics::CLICK_SYNC,
                &ClickSync {
                    rule_id: rule.rule_id,
                    clicks: 1,
                },
            );
        }

        resolution
    }

    /// Appends an arbitrary payload to a queue topic.
    pub fn enqueue(&self, topic: &str, payload: serde_json::Value) {
        self.queue.push(topic, payload);
    }

    /// Aggregated statistics for a health/metrics endpoint.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.stats(),
            limiter: self.limiter.stats(),
            breakers: self.breaker.all_states(),
            queues: self.queue.stats(),
            matcher: self.matcher.stats(),
            admission: self.pipeline.stats(),
        }
    }

    /// Starts the background maintenance loop: range-snapshot refresh
    /// and cache garbage collection. Keeps store I/O off the request
    /// path.
    pub fn spawn_maintenance(&self) -> MaintenanceTask {
        let matcher = Arc::clone(&self.matcher);
        let cache = Arc::clone(&self.cache);
        let interval = self.maintenance_interval;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?interval, "maintenance task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = matcher.refresh_if_stale().await {
                            warn!(error = %e, "range snapshot refresh failed");
                        }
                        let swept = cache.gc();
                        if swept > 0 {
                            info!(swept, "cache gc swept expired entries");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("maintenance task stopped");
        });

        MaintenanceTask {
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Starts the drain worker applying queued events to `sink`.
    pub fn spawn_drain_worker(&self, sink: Arc<dyn EventSink>) -> DrainTask {
        DrainWorker::new(
            Arc::clone(&self.queue),
            sink,
            self.queue_batch_size,
            self.maintenance_interval,
        )
        .spawn()
    }

    /// The shared queue, for callers wiring their own drain process.
    pub fn queue(&self) -> Arc<WriteBehindQueue> {
        Arc::clone(&self.queue)
    }
}

/// Handle to the running maintenance loop.
pub struct MaintenanceTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MaintenanceTask {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
