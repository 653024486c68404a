use jiff::Timestamp;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

/// Default bound on pending items per topic. Overflow drops the
/// oldest item rather than blocking the producer.
const DEFAULT_TOPIC_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("malformed payload: {0}")]
    Payload(String),
}

/// A pending message within a topic.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub topic: String,
    pub payload: Value,
    pub enqueued_at: Timestamp,
    pub attempts: u32,
}

/// An item that exhausted its retries.
#[derive(Debug, Clone)]
pub struct DeadItem {
    pub item: QueueItem,
    pub error: String,
    pub dead_at: Timestamp,
}

/// Per-topic counters for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub dead: usize,
    pub dropped: u64,
}

#[derive(Default)]
struct Topic {
    items: VecDeque<QueueItem>,
    dead: Vec<DeadItem>,
    dropped: u64,
}

/// At-least-once FIFO buffers, one per topic.
///
/// `push` appends in memory and never performs I/O; draining happens
/// out-of-band through [`process`](WriteBehindQueue::process). Order
/// is FIFO within a topic; nothing is guaranteed across topics.
pub struct WriteBehindQueue {
    topics: Mutex<HashMap<String, Topic>>,
    max_retries: u32,
    topic_capacity: usize,
}

impl WriteBehindQueue {
    pub fn new(max_retries: u32) -> Self {
        Self::with_capacity(max_retries, DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(max_retries: u32, topic_capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            max_retries,
            topic_capacity: topic_capacity.max(1),
        }
    }

    /// Appends a payload to `topic`. Never blocks, never errors
    /// toward the caller; a full topic drops its oldest item.
    pub fn push(&self, topic: &str, payload: Value) {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_owned()).or_default();

        if entry.items.len() >= self.topic_capacity {
            entry.items.pop_front();
            entry.dropped += 1;
            warn!(topic, dropped = entry.dropped, "topic full, dropped oldest item");
        }

        entry.items.push_back(QueueItem {
            topic: topic.to_owned(),
            payload,
            enqueued_at: Timestamp::now(),
            attempts: 0,
        });
    }

    /// Serialises `event` and pushes it. A value that cannot be
    /// serialised is logged and dropped; side-effect recording must
    /// never propagate an error back to a completed request.
    pub fn push_event<T: Serialize>(&self, topic: &str, event: &T) {
        match serde_json::to_value(event) {
            Ok(payload) => self.push(topic, payload),
            Err(e) => warn!(topic, error = %e, "dropping unserialisable event"),
        }
    }

    /// Pops up to `batch_size` items from `topic` and applies
    /// `handler` to each. Returns how many were applied successfully.
    ///
    /// A failing item is requeued at the back of the topic with its
    /// attempt count incremented; once it has failed more than the
    /// retry limit it moves to the dead-letter buffer instead.
    pub async fn process<H, Fut>(&self, topic: &str, batch_size: usize, handler: H) -> usize
    where
        H: Fn(Value) -> Fut,
        Fut: Future<Output = Result<(), QueueError>>,
    {
        let batch: Vec<QueueItem> = {
            let mut topics = self.topics.lock();
            match topics.get_mut(topic) {
                Some(entry) => {
                    let take = batch_size.min(entry.items.len());
                    entry.items.drain(..take).collect()
                }
                None => return 0,
            }
        };

        let mut processed = 0;
        for mut item in batch {
            match handler(item.payload.clone()).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    item.attempts += 1;
                    if item.attempts > self.max_retries {
                        warn!(
                            topic,
                            attempts = item.attempts,
                            error = %e,
                            "item exhausted retries, dead-lettering"
                        );
                        self.push_dead(item, e.to_string());
                    } else {
                        debug!(topic, attempts = item.attempts, error = %e, "requeueing failed item");
                        self.requeue(item);
                    }
                }
            }
        }
        processed
    }

    fn requeue(&self, item: QueueItem) {
        let mut topics = self.topics.lock();
        topics
            .entry(item.topic.clone())
            .or_default()
            .items
            .push_back(item);
    }

    fn push_dead(&self, item: QueueItem, error: String) {
        let mut topics = self.topics.lock();
        topics.entry(item.topic.clone()).or_default().dead.push(DeadItem {
            item,
            error,
            dead_at: Timestamp::now(),
        });
    }

    /// Pending items in one topic.
    pub fn size(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |t| t.items.len())
    }

    /// Drops a topic's pending items, dead letters included.
    pub fn clear(&self, topic: &str) {
        self.topics.lock().remove(topic);
    }

    /// Copies out a topic's dead letters.
    pub fn dead_letters(&self, topic: &str) -> Vec<DeadItem> {
        self.topics
            .lock()
            .get(topic)
            .map_or_else(Vec::new, |t| t.dead.clone())
    }

    /// Per-topic pending/dead/dropped counters.
    pub fn stats(&self) -> HashMap<String, QueueStats> {
        let topics = self.topics.lock();
        topics
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    QueueStats {
                        pending: t.items.len(),
                        dead: t.dead.len(),
                        dropped: t.dropped,
                    },
                )
            })
            .collect()
    }

    /// Names of topics that currently have pending items.
    pub fn pending_topics(&self) -> Vec<String> {
        let topics = self.topics.lock();
        topics
            .iter()
            .filter(|(_, t)| !t.items.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }
}
