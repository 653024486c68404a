use crate::queue::{QueueError, WriteBehindQueue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use turnstile_core::{AccessEvent, BlockEvent, EventSink};

/// Topic names the drain worker knows how to apply.
pub mod topics {
    pub const ACCESS_LOG: &str = "access_log";
    pub const CLICK_SYNC: &str = "click_sync";
    pub const RANGE_HIT: &str = "range_hit";
    pub const BLOCK_LOG: &str = "block_log";
    pub const BLACKLIST_ADD: &str = "blacklist_add";
}

/// Payload of a [`topics::CLICK_SYNC`] item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickSync {
    pub rule_id: i64,
    pub clicks: u64,
}

/// Payload of a [`topics::RANGE_HIT`] item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeHit {
    pub rule_id: i64,
    pub hits: u64,
}

/// Payload of a [`topics::BLACKLIST_ADD`] item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistAdd {
    pub cidr: String,
    pub reason: String,
}

fn payload_err(e: serde_json::Error) -> QueueError {
    QueueError::Payload(e.to_string())
}

fn sink_err(e: turnstile_core::StoreError) -> QueueError {
    QueueError::Handler(e.to_string())
}

/// Drains the write-behind queue into the store's write API.
///
/// Owns the periodic drain loop as a separate tokio task; the request
/// path only ever pushes. Dropping the returned [`DrainTask`] without
/// calling shutdown aborts nothing; the loop runs until told to stop.
pub struct DrainWorker {
    queue: Arc<WriteBehindQueue>,
    sink: Arc<dyn EventSink>,
    batch_size: usize,
    interval: Duration,
}

impl DrainWorker {
    pub fn new(
        queue: Arc<WriteBehindQueue>,
        sink: Arc<dyn EventSink>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            sink,
            batch_size,
            interval,
        }
    }

    /// Processes one batch from every known topic. Returns the total
    /// number of items applied.
    pub async fn drain_once(&self) -> usize {
        let mut total = 0;
        let sink = &self.sink;

        total += self
            .queue
            .process(topics::ACCESS_LOG, self.batch_size, |payload| async move {
                let event: AccessEvent = serde_json::from_value(payload).map_err(payload_err)?;
                sink.record_access(&event).await.map_err(sink_err)
            })
            .await;

        total += self
            .queue
            .process(topics::CLICK_SYNC, self.batch_size, |payload| async move {
                let sync: ClickSync = serde_json::from_value(payload).map_err(payload_err)?;
                sink.increment_clicks(sync.rule_id, sync.clicks)
                    .await
                    .map_err(sink_err)
            })
            .await;

        total += self
            .queue
            .process(topics::RANGE_HIT, self.batch_size, |payload| async move {
                let hit: RangeHit = serde_json::from_value(payload).map_err(payload_err)?;
                sink.record_range_hit(hit.rule_id, hit.hits)
                    .await
                    .map_err(sink_err)
            })
            .await;

        total += self
            .queue
            .process(topics::BLOCK_LOG, self.batch_size, |payload| async move {
                let event: BlockEvent = serde_json::from_value(payload).map_err(payload_err)?;
                sink.record_block(&event).await.map_err(sink_err)
            })
            .await;

        total += self
            .queue
            .process(
                topics::BLACKLIST_ADD,
                self.batch_size,
                |payload| async move {
                    let add: BlacklistAdd = serde_json::from_value(payload).map_err(payload_err)?;
                    sink.add_blacklist_entry(&add.cidr, &add.reason)
                        .await
                        .map_err(sink_err)
                },
            )
            .await;

        if total > 0 {
            debug!(items = total, "drained write-behind queue");
        }
        total
    }

    /// Starts the drain loop. One final drain runs on shutdown so a
    /// graceful stop does not strand buffered events.
    pub fn spawn(self) -> DrainTask {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?interval, "drain worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.drain_once().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            self.drain_once().await;
            info!("drain worker stopped");
        });

        DrainTask {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Handle to a running drain loop.
pub struct DrainTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DrainTask {
    /// Signals the loop to stop and waits for its final drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
