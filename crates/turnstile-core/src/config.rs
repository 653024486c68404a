use serde::{Deserialize, Serialize};

/// Typed configuration for the resolution core.
///
/// Resolved once per process by the serving layer and passed by
/// reference into each component's constructor. Every field has a
/// default, so a bare `CoreConfig::default()` produces a working
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// TTL applied to cached routing rules, in seconds.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Maximum number of entries in the first cache tier.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// TTL for cached negative (absent-key) results, in seconds.
    /// Kept short so deleted keys reappear quickly after creation.
    #[serde(default = "default_negative_ttl_seconds")]
    pub negative_ttl_seconds: u64,

    /// Length of a rate-limit window, in seconds.
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window: u64,

    /// Requests admitted per client key per window.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,

    /// Requests admitted across all clients per window.
    #[serde(default = "default_rate_limit_global_max")]
    pub rate_limit_global_max: u32,

    /// Consecutive failures before a circuit opens.
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// Seconds an open circuit waits before admitting a probe.
    #[serde(default = "default_breaker_cooldown_seconds")]
    pub breaker_cooldown_seconds: u64,

    /// Timeout applied to each breaker-guarded store call, in
    /// milliseconds. Elapsing counts as a failure.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Maximum age of the blacklist snapshot before a forced reload,
    /// in seconds.
    #[serde(default = "default_blacklist_refresh_ttl")]
    pub blacklist_refresh_ttl: u64,

    /// Minimum interval between blacklist version polls, in seconds.
    #[serde(default = "default_blacklist_poll_seconds")]
    pub blacklist_poll_seconds: u64,

    /// Items drained from a queue topic per batch.
    #[serde(default = "default_queue_batch_size")]
    pub queue_batch_size: usize,

    /// Times a failing queue item is retried before dead-lettering.
    #[serde(default = "default_queue_max_retries")]
    pub queue_max_retries: u32,

    /// Seconds an IP stays temporarily blocked after tripping the
    /// rate limiter or the behaviour check.
    #[serde(default = "default_temp_block_seconds")]
    pub temp_block_seconds: u64,

    /// Denials within `auto_blacklist_window` before an IP is
    /// blacklisted automatically.
    #[serde(default = "default_auto_blacklist_max_blocks")]
    pub auto_blacklist_max_blocks: u32,

    /// Window for counting denials toward auto-blacklisting, seconds.
    #[serde(default = "default_auto_blacklist_window")]
    pub auto_blacklist_window: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl_seconds(),
            cache_capacity: default_cache_capacity(),
            negative_ttl_seconds: default_negative_ttl_seconds(),
            rate_limit_window: default_rate_limit_window(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_global_max: default_rate_limit_global_max(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_seconds: default_breaker_cooldown_seconds(),
            store_timeout_ms: default_store_timeout_ms(),
            blacklist_refresh_ttl: default_blacklist_refresh_ttl(),
            blacklist_poll_seconds: default_blacklist_poll_seconds(),
            queue_batch_size: default_queue_batch_size(),
            queue_max_retries: default_queue_max_retries(),
            temp_block_seconds: default_temp_block_seconds(),
            auto_blacklist_max_blocks: default_auto_blacklist_max_blocks(),
            auto_blacklist_window: default_auto_blacklist_window(),
        }
    }
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_negative_ttl_seconds() -> u64 {
    30
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_rate_limit_max() -> u32 {
    60
}

fn default_rate_limit_global_max() -> u32 {
    1_000
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_seconds() -> u64 {
    30
}

fn default_store_timeout_ms() -> u64 {
    500
}

fn default_blacklist_refresh_ttl() -> u64 {
    300
}

fn default_blacklist_poll_seconds() -> u64 {
    10
}

fn default_queue_batch_size() -> usize {
    100
}

fn default_queue_max_retries() -> u32 {
    3
}

fn default_temp_block_seconds() -> u64 {
    3_600
}

fn default_auto_blacklist_max_blocks() -> u32 {
    5
}

fn default_auto_blacklist_window() -> u64 {
    300
}
