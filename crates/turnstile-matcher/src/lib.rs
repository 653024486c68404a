//! Sorted IP-range index for blacklisting and bot defence.
//!
//! Range rules live in the backing store; the matcher holds an
//! immutable, periodically refreshed snapshot and answers "is this
//! address covered, and by which rule" with a binary search. Refresh
//! uses copy-and-swap, so in-flight lookups keep reading the old
//! snapshot while a new one is built.

pub mod matcher;
pub mod rule;
pub mod snapshot;

pub use matcher::{IntervalMatcher, MatcherStats};
pub use rule::{parse_cidr, parse_ipv4, MatcherError, RangeKind, RangeRule};
pub use snapshot::RangeSnapshot;
