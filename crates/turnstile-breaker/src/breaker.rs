use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open for `{name}`, retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },
    #[error("dependency call timed out after {0:?}")]
    Timeout(Duration),
    #[error("dependency call failed: {0}")]
    Inner(E),
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    #[builder(default = 5)]
    pub failure_threshold: u32,

    /// Successes required in half-open before closing.
    #[builder(default = 1)]
    pub success_threshold: u32,

    /// How long an open circuit waits before admitting a probe.
    #[builder(default = Duration::from_secs(30))]
    pub cooldown: Duration,

    /// Failure percentage over the outcome window that also trips
    /// the circuit, even without a consecutive streak.
    #[builder(default = 50.0)]
    pub failure_rate: f64,

    /// Number of recent call outcomes considered for the rate check.
    #[builder(default = 10)]
    pub window_size: usize,

    /// A failure streak older than this no longer counts toward the
    /// consecutive threshold.
    #[builder(default = Duration::from_secs(60))]
    pub failure_window: Duration,

    /// Timeout applied to each guarded call.
    #[builder(default = Duration::from_millis(500))]
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Observability view of one circuit.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub seconds_since_last_failure: Option<u64>,
}

struct Circuit {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    /// When the in-flight half-open probe started, if any.
    probe_started: Option<Instant>,
    /// Recent call outcomes, `true` for success.
    history: VecDeque<bool>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            half_open_successes: 0,
            probe_started: None,
            history: VecDeque::new(),
        }
    }

    fn push_outcome(&mut self, success: bool, window_size: usize) {
        self.history.push_back(success);
        while self.history.len() > window_size {
            self.history.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let failures = self.history.iter().filter(|ok| !**ok).count();
        failures as f64 / self.history.len() as f64 * 100.0
    }
}

/// Per-dependency circuit breakers behind a shared registry.
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Would a call to `name` be allowed right now?
    ///
    /// This is a non-reserving peek for observability and manual
    /// call-site use. [`execute`](Self::execute) goes through the
    /// reserving path, which is what guarantees a single half-open
    /// probe under concurrency.
    pub fn can_execute(&self, name: &str) -> bool {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name.to_owned()).or_insert_with(Circuit::new);
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(circuit),
            CircuitState::HalfOpen => !self.probe_active(circuit),
        }
    }

    /// Runs `primary` under the circuit and the call timeout.
    ///
    /// An open circuit fails fast without touching the dependency; a
    /// primary error or timeout is recorded and surfaced. Use
    /// [`execute_or`](Self::execute_or) to map all three onto a
    /// fallback value.
    pub async fn execute<T, E, Fut>(&self, name: &str, primary: Fut) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire(name) {
            debug!(name, "circuit open, failing fast");
            return Err(BreakerError::Open {
                name: name.to_owned(),
                retry_after: self.retry_after(name),
            });
        }

        match tokio::time::timeout(self.config.call_timeout, primary).await {
            Ok(Ok(value)) => {
                self.record_success(name);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(name);
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                warn!(name, timeout = ?self.config.call_timeout, "guarded call timed out");
                self.record_failure(name);
                Err(BreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// [`execute`](Self::execute), but every failure mode resolves to
    /// the fallback.
    pub async fn execute_or<T, E, Fut, F>(&self, name: &str, primary: Fut, fallback: F) -> T
    where
        Fut: Future<Output = Result<T, E>>,
        F: FnOnce(BreakerError<E>) -> T,
    {
        match self.execute(name, primary).await {
            Ok(value) => value,
            Err(e) => fallback(e),
        }
    }

    /// Records a successful call against `name`.
    pub fn record_success(&self, name: &str) {
        let window_size = self.config.window_size;
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name.to_owned()).or_insert_with(Circuit::new);

        circuit.success_count += 1;
        circuit.consecutive_failures = 0;
        circuit.push_outcome(true, window_size);

        if circuit.state == CircuitState::HalfOpen {
            circuit.probe_started = None;
            circuit.half_open_successes += 1;
            if circuit.half_open_successes >= self.config.success_threshold {
                debug!(name, "probe succeeded, closing circuit");
                circuit.state = CircuitState::Closed;
                circuit.half_open_successes = 0;
                circuit.opened_at = None;
                circuit.history.clear();
            }
        }
    }

    /// Records a failed call against `name`, tripping the circuit
    /// when a threshold is crossed.
    pub fn record_failure(&self, name: &str) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name.to_owned()).or_insert_with(Circuit::new);

        // An old streak has aged out of the rolling window.
        if circuit
            .last_failure_at
            .is_some_and(|at| now.duration_since(at) > self.config.failure_window)
        {
            circuit.consecutive_failures = 0;
        }

        circuit.failure_count += 1;
        circuit.consecutive_failures += 1;
        circuit.last_failure_at = Some(now);
        circuit.push_outcome(false, self.config.window_size);

        match circuit.state {
            CircuitState::HalfOpen => {
                warn!(name, "probe failed, reopening circuit");
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                circuit.probe_started = None;
                circuit.half_open_successes = 0;
            }
            CircuitState::Closed if self.should_trip(circuit) => {
                warn!(
                    name,
                    consecutive = circuit.consecutive_failures,
                    "failure threshold crossed, opening circuit"
                );
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
            }
            _ => {}
        }
    }

    /// Resets `name` to a fresh closed circuit.
    pub fn reset(&self, name: &str) {
        self.circuits.lock().insert(name.to_owned(), Circuit::new());
    }

    pub fn state(&self, name: &str) -> CircuitState {
        let mut circuits = self.circuits.lock();
        circuits
            .entry(name.to_owned())
            .or_insert_with(Circuit::new)
            .state
    }

    /// Snapshots every known circuit, for the stats surface.
    pub fn all_states(&self) -> HashMap<String, BreakerSnapshot> {
        let circuits = self.circuits.lock();
        circuits
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    BreakerSnapshot {
                        state: c.state,
                        failure_count: c.failure_count,
                        success_count: c.success_count,
                        consecutive_failures: c.consecutive_failures,
                        seconds_since_last_failure: c.last_failure_at.map(|at| at.elapsed().as_secs()),
                    },
                )
            })
            .collect()
    }

    /// Admits the call, reserving the half-open probe slot when the
    /// circuit is recovering. Both the open-to-half-open transition
    /// and the reservation happen under the registry lock, so
    /// concurrent callers can never both become the probe.
    fn try_acquire(&self, name: &str) -> bool {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(name.to_owned()).or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.cooldown_elapsed(circuit) {
                    debug!(name, "cooldown elapsed, admitting probe");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_successes = 0;
                    circuit.probe_started = Some(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_active(circuit) {
                    false
                } else {
                    circuit.probe_started = Some(now);
                    true
                }
            }
        }
    }

    fn cooldown_elapsed(&self, circuit: &Circuit) -> bool {
        circuit
            .opened_at
            .is_none_or(|at| at.elapsed() >= self.config.cooldown)
    }

    /// A probe whose caller vanished must not wedge the circuit; the
    /// slot goes stale after twice the call timeout.
    fn probe_active(&self, circuit: &Circuit) -> bool {
        circuit.probe_started.is_some_and(|started| {
            started.elapsed() < self.config.call_timeout.saturating_mul(2)
        })
    }

    fn should_trip(&self, circuit: &Circuit) -> bool {
        if circuit.consecutive_failures >= self.config.failure_threshold {
            return true;
        }
        circuit.history.len() >= self.config.window_size
            && circuit.failure_rate() >= self.config.failure_rate
    }

    fn retry_after(&self, name: &str) -> Duration {
        let circuits = self.circuits.lock();
        circuits
            .get(name)
            .and_then(|c| c.opened_at)
            .map(|at| self.config.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(self.config.cooldown)
    }
}
