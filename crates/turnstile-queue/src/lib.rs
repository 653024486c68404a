//! Write-behind queueing for access logs, click counts, and other
//! side effects that must never sit on the request path.
//!
//! [`WriteBehindQueue`] holds per-topic FIFO buffers fed by a
//! non-blocking `push`; the [`DrainWorker`] task pops batches on an
//! interval and applies them to the store's write API. A failing item
//! is retried a bounded number of times, then moved to the topic's
//! dead-letter buffer, giving at-least-once delivery up to the retry
//! limit.

pub mod queue;
pub mod worker;

pub use queue::{DeadItem, QueueError, QueueItem, QueueStats, WriteBehindQueue};
pub use worker::{topics, BlacklistAdd, ClickSync, DrainTask, DrainWorker, RangeHit};
