use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use turnstile_core::{Clock, SystemClock};
use typed_builder::TypedBuilder;

/// The subject key of the global scope.
const GLOBAL_KEY: &str = "global";

/// How many tracked keys the counter map may hold before a prune.
const PRUNE_WATERMARK: usize = 10_000;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the current window, zero when rejected.
    pub remaining: u32,
    /// Time until the next window opens; positive when rejected.
    pub retry_after: Duration,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RateLimiterConfig {
    /// Window length. Sub-second windows are rounded up to 1s.
    #[builder(default = Duration::from_secs(60))]
    pub window: Duration,

    /// Requests admitted per client key per window.
    #[builder(default = 60)]
    pub client_max: u32,

    /// Requests admitted across all clients per window.
    #[builder(default = 1_000)]
    pub global_max: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub tracked_keys: usize,
    pub window_seconds: u64,
    pub client_max: u32,
    pub global_max: u32,
}

struct Bucket {
    window_index: u64,
    count: u32,
}

/// Fixed-window request counter with global and per-client scopes.
pub struct RateLimiter {
    window_secs: u64,
    client_max: u32,
    global_max: u32,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_secs: config.window.as_secs().max(1),
            client_max: config.client_max,
            global_max: config.global_max,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Counts a request against the global scope.
    pub fn check_global(&self) -> RateDecision {
        self.check_scope(GLOBAL_KEY, self.global_max)
    }

    /// Counts a request against one client's scope.
    pub fn check_client(&self, key: &str) -> RateDecision {
        self.check_scope(&format!("client:{}", key), self.client_max)
    }

    /// Runs both scopes in order. A global rejection skips the client
    /// check entirely, so rejected traffic does not grow the map.
    pub fn check(&self, client_key: &str) -> RateDecision {
        let global = self.check_global();
        if !global.allowed {
            return global;
        }
        self.check_client(client_key)
    }

    fn check_scope(&self, key: &str, limit: u32) -> RateDecision {
        let now_secs = self.clock.now().as_second().max(0) as u64;
        let window_index = now_secs / self.window_secs;
        let next_window_in = (window_index + 1) * self.window_secs - now_secs;

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            window_index,
            count: 0,
        });

        // A bucket left over from an earlier window resets in place.
        if bucket.window_index != window_index {
            bucket.window_index = window_index;
            bucket.count = 0;
        }

        if bucket.count >= limit {
            debug!(key, limit, "rate limit exceeded");
            return RateDecision {
                allowed: false,
                remaining: 0,
                retry_after: Duration::from_secs(next_window_in),
            };
        }

        bucket.count += 1;
        let remaining = limit - bucket.count;

        if buckets.len() > PRUNE_WATERMARK {
            Self::prune(&mut buckets, window_index);
        }

        RateDecision {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    /// Drops every bucket older than the previous window. Keys seen
    /// in the current or previous window survive, bounding the map at
    /// live keys plus whatever accumulated since the last prune.
    fn prune(buckets: &mut HashMap<String, Bucket>, current_window: u64) {
        let cutoff = current_window.saturating_sub(1);
        buckets.retain(|_, b| b.window_index >= cutoff);
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            tracked_keys: self.buckets.lock().len(),
            window_seconds: self.window_secs,
            client_max: self.client_max,
            global_max: self.global_max,
        }
    }
}
