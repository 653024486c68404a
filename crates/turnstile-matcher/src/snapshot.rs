use crate::rule::{parse_cidr, RangeKind, RangeRule};
use std::time::Instant;
use tracing::warn;
use turnstile_core::RawRangeRule;

/// An immutable, sorted view of the enabled range rules.
///
/// Built once per refresh and shared behind an `Arc`; readers never
/// see a partially updated rule set.
#[derive(Debug)]
pub struct RangeSnapshot {
    rules: Vec<RangeRule>,
    version: u64,
    loaded_at: Instant,
}

impl RangeSnapshot {
    /// An empty snapshot at version zero, used before the first load.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            version: 0,
            loaded_at: Instant::now(),
        }
    }

    /// Normalises raw store rows into a sorted snapshot.
    ///
    /// Disabled rows are skipped; rows with unparsable CIDR text are
    /// skipped with a warning rather than failing the whole load.
    pub fn from_raw(raw: Vec<RawRangeRule>, version: u64) -> Self {
        let mut rules: Vec<RangeRule> = raw
            .into_iter()
            .filter(|r| r.enabled)
            .filter_map(|r| match parse_cidr(&r.cidr) {
                Ok((ip_start, ip_end)) => Some(RangeRule {
                    rule_id: r.rule_id,
                    ip_start,
                    ip_end,
                    kind: RangeKind::from_store(&r.kind),
                    category: r.category,
                    name: r.name,
                    cidr: r.cidr,
                }),
                Err(e) => {
                    warn!(rule_id = r.rule_id, cidr = %r.cidr, error = %e, "skipping unparsable range rule");
                    None
                }
            })
            .collect();
        rules.sort_by_key(|r| r.ip_start);

        Self {
            rules,
            version,
            loaded_at: Instant::now(),
        }
    }

    /// Binary search over the sorted, non-overlapping ranges.
    /// Boundary addresses are covered inclusively on both ends.
    pub fn lookup(&self, ip: u32) -> Option<&RangeRule> {
        let idx = self.rules.partition_point(|r| r.ip_start <= ip);
        if idx == 0 {
            return None;
        }
        let candidate = &self.rules[idx - 1];
        candidate.covers(ip).then_some(candidate)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn age(&self) -> std::time::Duration {
        self.loaded_at.elapsed()
    }
}
