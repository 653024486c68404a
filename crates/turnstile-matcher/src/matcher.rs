use crate::rule::{parse_ipv4, RangeKind, RangeRule};
use crate::snapshot::RangeSnapshot;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use turnstile_core::{RangeRuleSource, StoreError};

/// Observability view of the active snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MatcherStats {
    pub rules: usize,
    pub version: u64,
    pub age_seconds: u64,
}

/// The CIDR-range classifier used for blacklisting and bot defence.
///
/// Lookups read the current snapshot through an `Arc` clone and never
/// block on a refresh; refreshes build a replacement snapshot and
/// swap it in. Staleness is bounded two ways: a version poll (rate
/// limited by `poll_interval`) triggers an early reload after any
/// external rule mutation, and `refresh_ttl` forces a reload even
/// when the version counter is unreachable or unchanged.
pub struct IntervalMatcher {
    source: Arc<dyn RangeRuleSource>,
    snapshot: RwLock<Arc<RangeSnapshot>>,
    refresh_ttl: Duration,
    poll_interval: Duration,
    last_poll: parking_lot::Mutex<Option<Instant>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl IntervalMatcher {
    pub fn new(
        source: Arc<dyn RangeRuleSource>,
        refresh_ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(RangeSnapshot::empty())),
            refresh_ttl,
            poll_interval,
            last_poll: parking_lot::Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the rule covering `ip`, if any. Invalid or non-IPv4
    /// addresses are simply not covered.
    pub fn lookup(&self, ip: &str) -> Option<RangeRule> {
        let ip = parse_ipv4(ip)?;
        self.lookup_u32(ip)
    }

    pub fn lookup_u32(&self, ip: u32) -> Option<RangeRule> {
        let snapshot = Arc::clone(&self.snapshot.read());
        snapshot.lookup(ip).cloned()
    }

    /// Returns `true` if `ip` matches a rule of the given kind.
    pub fn matches_kind(&self, ip: &str, kind: RangeKind) -> bool {
        self.lookup(ip).is_some_and(|rule| rule.kind == kind)
    }

    pub fn is_malicious(&self, ip: &str) -> bool {
        self.matches_kind(ip, RangeKind::Malicious)
    }

    pub fn is_known_bot(&self, ip: &str) -> bool {
        self.matches_kind(ip, RangeKind::Bot)
    }

    pub fn is_datacenter(&self, ip: &str) -> bool {
        self.matches_kind(ip, RangeKind::Datacenter)
    }

    /// Unconditionally reloads the snapshot from the source.
    ///
    /// On failure the previous snapshot stays active; serving stale
    /// rules beats serving none.
    pub async fn load(&self) -> Result<(), StoreError> {
        let _guard = self.refresh_lock.lock().await;
        self.reload().await
    }

    /// Reloads if the snapshot is stale.
    ///
    /// Returns `Ok(true)` when a reload happened. Never runs more
    /// than one refresh at a time; a caller finding a refresh already
    /// in flight returns immediately.
    pub async fn refresh_if_stale(&self) -> Result<bool, StoreError> {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            return Ok(false);
        };

        let (age, version) = {
            let snapshot = self.snapshot.read();
            (snapshot.age(), snapshot.version())
        };

        if age < self.refresh_ttl {
            if !self.poll_due() {
                return Ok(false);
            }
            let current = self.source.version().await?;
            if current == version {
                return Ok(false);
            }
            debug!(
                snapshot_version = version,
                source_version = current,
                "range-rule version changed, reloading"
            );
        }

        self.reload().await?;
        Ok(true)
    }

    /// Rate-limits version polls so lookups never turn into a
    /// per-request store query.
    fn poll_due(&self) -> bool {
        let mut last_poll = self.last_poll.lock();
        let due = last_poll.is_none_or(|at| at.elapsed() >= self.poll_interval);
        if due {
            *last_poll = Some(Instant::now());
        }
        due
    }

    async fn reload(&self) -> Result<(), StoreError> {
        let version = self.source.version().await?;
        let raw = match self.source.load_rules().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "range-rule load failed, keeping previous snapshot");
                return Err(e);
            }
        };

        let snapshot = RangeSnapshot::from_raw(raw, version);
        info!(rules = snapshot.len(), version, "range snapshot loaded");
        *self.snapshot.write() = Arc::new(snapshot);
        Ok(())
    }

    pub fn stats(&self) -> MatcherStats {
        let snapshot = self.snapshot.read();
        MatcherStats {
            rules: snapshot.len(),
            version: snapshot.version(),
            age_seconds: snapshot.age().as_secs(),
        }
    }
}
