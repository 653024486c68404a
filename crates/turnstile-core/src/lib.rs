//! Core types and traits for the Turnstile redirect resolver.
//!
//! This crate provides the shared vocabulary of the resolution core:
//! the validated [`RouteKey`], the [`RouteRule`] it resolves to, the
//! [`RequestContext`] fed into the admission pipeline, the typed
//! [`CoreConfig`], and the narrow store traits ([`RuleStore`],
//! [`RangeRuleSource`], [`EventSink`]) behind which the external
//! persistence layer lives.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod route_key;
pub mod rule;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoreConfig;
pub use context::RequestContext;
pub use error::{CoreError, StoreError};
pub use route_key::RouteKey;
pub use rule::RouteRule;
pub use store::{
    AccessEvent, BlockEvent, EventSink, MemoryStore, RangeRuleSource, RawRangeRule, RuleStore,
};
