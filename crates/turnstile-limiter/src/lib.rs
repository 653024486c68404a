//! Fixed-window rate limiting, scoped globally and per client key.
//!
//! Counters are keyed by `floor(now / window)`; a bucket that rolls
//! past its window is reset in place on the next touch, and fully
//! cold keys are pruned once the map grows past a high-water mark.
//! Under contention the limiter may briefly overcount (rejecting a
//! request the budget could have absorbed is acceptable); it never
//! undercounts.

pub mod limiter;

pub use limiter::{LimiterStats, RateDecision, RateLimiter, RateLimiterConfig};
