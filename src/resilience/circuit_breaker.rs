//! Circuit breaker for upstream protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: upstream assumed down, requests fail fast (caller dispatches the fallback)
//! - Half-Open: a limited number of trial requests test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold (timeouts count)
//! Open → Half-Open: reset_timeout elapsed, evaluated on the next call attempt
//! Half-Open → Closed: success_threshold trial calls succeed
//! Half-Open → Open: any trial call fails
//! ```
//!
//! # Design Decisions
//! - Per-route circuit breaker (not global)
//! - Every transition bumps a generation; outcomes of calls admitted under an
//!   older generation are ignored, so a burst of concurrent failures cannot
//!   count twice across a transition
//! - The upstream future is dropped on timeout, which cancels the call

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::schema::CircuitBreakerConfig;
use crate::observability::metrics;
use crate::resilience::timeouts::with_deadline;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Why a guarded call produced no upstream result.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Short-circuited; the upstream was not invoked.
    Open,
    /// The upstream missed its deadline and was cancelled.
    Timeout(Duration),
    /// The upstream returned an error.
    Failed(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    last_transition: Instant,
    generation: u64,
}

/// Failure-tracking state machine for one route.
#[derive(Debug)]
pub struct CircuitBreaker {
    route_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(route_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            route_id: route_id.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                last_transition: Instant::now(),
                generation: 0,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Current state as of the last transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures counted while closed.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.last_transition = Instant::now();
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        if to != CircuitState::Open {
            inner.failure_count = 0;
        }

        match to {
            CircuitState::Open => tracing::warn!(
                route = %self.route_id,
                breaker = %self.config.name,
                from = from.as_str(),
                "Circuit opened"
            ),
            _ => tracing::info!(
                route = %self.route_id,
                breaker = %self.config.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit state changed"
            ),
        }
        metrics::record_circuit_state(&self.route_id, to);
    }

    /// Ask to call the upstream. `None` means short-circuit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let reset = Duration::from_millis(self.config.reset_timeout_ms);
            if inner.last_transition.elapsed() < reset {
                return None;
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        let trial = inner.state == CircuitState::HalfOpen;
        if trial {
            if inner.half_open_in_flight >= self.config.half_open_max_calls {
                return None;
            }
            inner.half_open_in_flight += 1;
        }

        Some(CallPermit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Run `invoke` under the breaker with the configured deadline.
    ///
    /// `invoke` is not called when the circuit is open. `is_failure` lets the
    /// caller count a successful result (e.g. a 5xx response) as a failure;
    /// such results are still returned.
    pub async fn call<T, E, F, Fut>(self: &Arc<Self>, invoke: F, is_failure: impl FnOnce(&T) -> bool) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(BreakerError::Open);
        };

        let deadline = self.timeout();
        match with_deadline(deadline, invoke()).await {
            Ok(Ok(value)) => {
                if is_failure(&value) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.failure();
                Err(BreakerError::Failed(e))
            }
            Err(elapsed) => {
                permit.failure();
                Err(BreakerError::Timeout(elapsed.deadline()))
            }
        }
    }
}

/// Admission to call the upstream once.
///
/// Report the outcome with [`CallPermit::success`] or [`CallPermit::failure`].
/// Dropping an unsettled trial permit frees its half-open slot without
/// counting an outcome.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

/// Breakers of every guarded route, keyed by route id.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, route_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(route_id).map(|b| Arc::clone(b.value()))
    }

    /// The route's registered breaker, or a closed one outside the registry.
    ///
    /// A request holding a table snapshot from before a reload may name a
    /// route the registry already dropped; it must not bring that entry back.
    pub fn get_or_detached(&self, route_id: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.get(route_id)
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(route_id, config.clone())))
    }

    /// Align the registry with a newly published route set.
    ///
    /// Breakers whose route and settings are unchanged keep their state; new
    /// or changed ones start closed; breakers of removed routes are dropped.
    pub fn sync<'a>(&self, guarded: impl IntoIterator<Item = (&'a str, &'a CircuitBreakerConfig)>) {
        let guarded: Vec<(&str, &CircuitBreakerConfig)> = guarded.into_iter().collect();

        self.breakers
            .retain(|id, _| guarded.iter().any(|(route_id, _)| *route_id == id.as_str()));

        for (route_id, config) in guarded {
            let unchanged = self
                .breakers
                .get(route_id)
                .is_some_and(|existing| existing.config() == config);
            if !unchanged {
                self.breakers
                    .insert(route_id.to_string(), Arc::new(CircuitBreaker::new(route_id, config.clone())));
                metrics::record_circuit_state(route_id, CircuitState::Closed);
            }
        }
    }

    /// `(route id, state)` of every breaker, sorted by route id.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
