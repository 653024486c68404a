//! Circuit breaking for calls to the backing store.
//!
//! One state machine per named dependency: `closed` passes calls
//! through and counts failures, `open` short-circuits to the fallback
//! until a cool-down elapses, `half-open` admits exactly one probe
//! whose outcome decides whether the circuit closes again. Calls run
//! under a timeout; elapsing counts as a failure.

pub mod breaker;

pub use breaker::{
    BreakerConfig, BreakerError, BreakerSnapshot, CircuitBreaker, CircuitState,
};
