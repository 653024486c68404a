pub mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::route_key::RouteKey;
use crate::rule::RouteRule;
use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// An access-log row produced for every successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub rule_id: i64,
    pub visitor_ip: String,
    pub user_agent: String,
    pub referer: String,
    pub at: Timestamp,
}

/// A record of a denied request, written for audit and for the
/// auto-blacklist counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub visitor_ip: String,
    pub reason: String,
    pub detail: String,
    pub user_agent: String,
    pub path: String,
    pub at: Timestamp,
}

/// A blacklist range row as the store hands it out. Parsing into the
/// matcher's numeric form happens at snapshot-load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRangeRule {
    pub rule_id: i64,
    /// CIDR notation or a single IPv4 address.
    pub cidr: String,
    /// One of `malicious`, `bot`, `datacenter`, `proxy`, `custom`.
    pub kind: String,
    pub category: String,
    pub name: String,
    pub enabled: bool,
}

/// Read access to routing rules.
#[async_trait]
pub trait RuleStore: Send + Sync + 'static {
    /// Retrieves the routing rule for a key.
    ///
    /// Returns `Ok(None)` if no rule exists for the key.
    async fn get_rule(&self, key: &RouteKey) -> Result<Option<RouteRule>, StoreError>;
}

/// Read access to blacklist ranges and their version counter.
///
/// The version is incremented externally on any rule mutation; the
/// matcher compares it against its snapshot to decide when to reload.
#[async_trait]
pub trait RangeRuleSource: Send + Sync + 'static {
    /// Current version of the range-rule set.
    async fn version(&self) -> Result<u64, StoreError>;

    /// Loads all range rules, enabled or not.
    async fn load_rules(&self) -> Result<Vec<RawRangeRule>, StoreError>;
}

/// Write access for events the drain worker applies out-of-band.
///
/// Nothing on the request path calls these directly; events travel
/// through the write-behind queue first.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn record_access(&self, event: &AccessEvent) -> Result<(), StoreError>;

    async fn increment_clicks(&self, rule_id: i64, clicks: u64) -> Result<(), StoreError>;

    async fn record_range_hit(&self, rule_id: i64, hits: u64) -> Result<(), StoreError>;

    async fn record_block(&self, event: &BlockEvent) -> Result<(), StoreError>;

    async fn add_blacklist_entry(&self, cidr: &str, reason: &str) -> Result<(), StoreError>;
}
