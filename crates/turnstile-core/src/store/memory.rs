use crate::error::StoreError;
use crate::route_key::RouteKey;
use crate::rule::RouteRule;
use crate::store::{
    AccessEvent, BlockEvent, EventSink, RangeRuleSource, RawRangeRule, RuleStore,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory implementation of the store traits.
///
/// Backs tests and local wiring. DashMap gives sharded locking so
/// concurrent readers and writers on different keys don't contend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rules: DashMap<String, RouteRule>,
    ranges: Mutex<Vec<RawRangeRule>>,
    range_version: AtomicU64,
    accesses: Mutex<Vec<AccessEvent>>,
    blocks: Mutex<Vec<BlockEvent>>,
    clicks: DashMap<i64, u64>,
    range_hits: DashMap<i64, u64>,
    blacklist_adds: Mutex<Vec<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a routing rule.
    pub fn put_rule(&self, key: &RouteKey, rule: RouteRule) {
        self.rules.insert(key.as_str().to_owned(), rule);
    }

    /// Removes a routing rule. Returns `true` if it existed.
    pub fn remove_rule(&self, key: &RouteKey) -> bool {
        self.rules.remove(key.as_str()).is_some()
    }

    /// Replaces the range-rule set and bumps the version counter.
    pub fn put_ranges(&self, ranges: Vec<RawRangeRule>) {
        *self.ranges.lock() = ranges;
        self.range_version.fetch_add(1, Ordering::SeqCst);
    }

    /// Bumps the version without changing the rules, as an external
    /// mutation through the admin surface would.
    pub fn bump_version(&self) {
        self.range_version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn recorded_accesses(&self) -> Vec<AccessEvent> {
        self.accesses.lock().clone()
    }

    pub fn recorded_blocks(&self) -> Vec<BlockEvent> {
        self.blocks.lock().clone()
    }

    pub fn clicks_for(&self, rule_id: i64) -> u64 {
        self.clicks.get(&rule_id).map(|c| *c).unwrap_or(0)
    }

    pub fn range_hits_for(&self, rule_id: i64) -> u64 {
        self.range_hits.get(&rule_id).map(|c| *c).unwrap_or(0)
    }

    pub fn blacklist_entries(&self) -> Vec<(String, String)> {
        self.blacklist_adds.lock().clone()
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn get_rule(&self, key: &RouteKey) -> Result<Option<RouteRule>, StoreError> {
        Ok(self.rules.get(key.as_str()).map(|r| r.clone()))
    }
}

#[async_trait]
impl RangeRuleSource for MemoryStore {
    async fn version(&self) -> Result<u64, StoreError> {
        Ok(self.range_version.load(Ordering::SeqCst))
    }

    async fn load_rules(&self) -> Result<Vec<RawRangeRule>, StoreError> {
        Ok(self.ranges.lock().clone())
    }
}

#[async_trait]
impl EventSink for MemoryStore {
    async fn record_access(&self, event: &AccessEvent) -> Result<(), StoreError> {
        self.accesses.lock().push(event.clone());
        Ok(())
    }

    async fn increment_clicks(&self, rule_id: i64, clicks: u64) -> Result<(), StoreError> {
        *self.clicks.entry(rule_id).or_insert(0) += clicks;
        Ok(())
    }

    async fn record_range_hit(&self, rule_id: i64, hits: u64) -> Result<(), StoreError> {
        *self.range_hits.entry(rule_id).or_insert(0) += hits;
        Ok(())
    }

    async fn record_block(&self, event: &BlockEvent) -> Result<(), StoreError> {
        self.blocks.lock().push(event.clone());
        Ok(())
    }

    async fn add_blacklist_entry(&self, cidr: &str, reason: &str) -> Result<(), StoreError> {
        self.blacklist_adds
            .lock()
            .push((cidr.to_owned(), reason.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::Timestamp;

    fn key(s: &str) -> RouteKey {
        RouteKey::new_unchecked(s)
    }

    fn rule(id: i64, url: &str) -> RouteRule {
        RouteRule {
            rule_id: id,
            target_url: url.to_string(),
            expire_at: None,
        }
    }

    #[tokio::test]
    async fn put_and_get_rule() {
        let store = MemoryStore::new();
        store.put_rule(&key("abc"), rule(1, "https://example.com"));

        let found = store.get_rule(&key("abc")).await.unwrap().unwrap();
        assert_eq!(found.target_url, "https://example.com");
        assert!(store.get_rule(&key("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn version_bumps_on_range_update() {
        let store = MemoryStore::new();
        let v0 = store.version().await.unwrap();

        store.put_ranges(vec![RawRangeRule {
            rule_id: 1,
            cidr: "10.0.0.0/8".into(),
            kind: "datacenter".into(),
            category: "cloud".into(),
            name: "test".into(),
            enabled: true,
        }]);

        assert_eq!(store.version().await.unwrap(), v0 + 1);
        assert_eq!(store.load_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sink_accumulates_events() {
        let store = MemoryStore::new();

        store.increment_clicks(7, 2).await.unwrap();
        store.increment_clicks(7, 3).await.unwrap();
        assert_eq!(store.clicks_for(7), 5);

        store.record_range_hit(9, 1).await.unwrap();
        assert_eq!(store.range_hits_for(9), 1);

        store
            .record_access(&AccessEvent {
                rule_id: 7,
                visitor_ip: "203.0.113.9".into(),
                user_agent: "test".into(),
                referer: String::new(),
                at: Timestamp::now(),
            })
            .await
            .unwrap();
        assert_eq!(store.recorded_accesses().len(), 1);
    }
}
