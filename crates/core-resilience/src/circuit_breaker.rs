//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: Testing if service has recovered
//!
//! The breaker is purely an admission gate. It never retries anything itself;
//! see [`crate::retry::RetryExecutor`] for the attempt loop that consults it.
//!
//! # Half-open probing
//!
//! Admission during HalfOpen is best-effort: every caller that asks while the
//! breaker is HalfOpen is admitted, so several probes may be in flight at once
//! when callers race at the cooldown boundary. The first recorded failure
//! reopens the circuit regardless of how many probes are outstanding.

use super::error::ResilienceError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Stand-in deadline for cooldowns that overflow `Instant`, about 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    /// Next probe time indicates when to try half-open
    Open { next_probe: Instant },
    /// Circuit is half-open, testing service recovery
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name, used in logs and status snapshots
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Number of successes in half-open to close circuit
    pub success_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate the thresholds
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be at least 1".to_string());
        }

        Ok(())
    }
}

/// A single state change, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: Instant,
}

/// Read-only snapshot of the breaker for dashboards and logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// When an open circuit will admit its next probe
    pub next_attempt: Option<Instant>,
    pub last_state_change: Instant,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_state_change: Instant,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_state_change: Instant::now(),
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning is cheap and clones share state, so one breaker can guard a
/// dependency that many executors call.
///
/// # Example
/// ```no_run
/// use keel_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
///     let result = breaker.call(|| async {
///         Ok::<_, ResilienceError>(42)
///     }).await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
    events: broadcast::Sender<StateTransition>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState::new())),
            events,
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribe to state transitions
    ///
    /// Slow subscribers lose the oldest events rather than blocking the breaker.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }

    /// Get the current state of the circuit breaker
    pub async fn get_state(&self) -> CircuitState {
        let state = self.state.lock().await;
        state.state
    }

    /// Get current failure count
    pub async fn get_failure_count(&self) -> u32 {
        let state = self.state.lock().await;
        state.consecutive_failures
    }

    /// Get current success count
    pub async fn get_success_count(&self) -> u32 {
        let state = self.state.lock().await;
        state.consecutive_successes
    }

    /// Snapshot of state and counters
    pub async fn status(&self) -> CircuitStatus {
        let state = self.state.lock().await;
        let next_attempt = match state.state {
            CircuitState::Open { next_probe } => Some(next_probe),
            _ => None,
        };

        CircuitStatus {
            state: state.state,
            failure_count: state.consecutive_failures,
            success_count: state.consecutive_successes,
            next_attempt,
            last_state_change: state.last_state_change,
        }
    }

    /// Reset the circuit breaker to closed state
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        self.transition(&mut state, CircuitState::Closed);
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
    }

    /// Ask whether a request may proceed
    ///
    /// While Open, the first call at or after the cooldown deadline moves the
    /// breaker to HalfOpen and is admitted as a probe.
    pub async fn allow_request(&self) -> bool {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { next_probe } => {
                if Instant::now() >= next_probe {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    state.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;

                if state.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                }
            }
            CircuitState::Open { .. } => {
                // A call admitted before the circuit opened finished late
                debug!("Ignoring success recorded while circuit is open");
            }
        }
    }

    /// Record a failed request
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;

                if state.consecutive_failures >= self.config.failure_threshold {
                    let next_probe = self.next_probe_deadline();
                    self.transition(&mut state, CircuitState::Open { next_probe });
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                let next_probe = self.next_probe_deadline();
                self.transition(&mut state, CircuitState::Open { next_probe });
                state.consecutive_successes = 0;
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Execute a single operation behind the breaker, without retries
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        if !self.allow_request().await {
            return Err(ResilienceError::CircuitOpen);
        }

        match op().await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(e) => {
                if e.should_trip_breaker() {
                    self.record_failure().await;
                }
                Err(e)
            }
        }
    }

    /// When an opening circuit admits its next probe. A cooldown too large
    /// to represent keeps the circuit open until [`CircuitBreaker::reset`].
    fn next_probe_deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.config.open_timeout)
            .unwrap_or_else(|| now + FAR_FUTURE)
    }

    /// Apply a transition while holding the state lock
    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        if from == to {
            return;
        }

        let at = Instant::now();
        state.state = to;
        state.last_state_change = at;

        match to {
            CircuitState::Open { .. } => warn!(
                from = %from,
                failures = state.consecutive_failures,
                cooldown_ms = self.config.open_timeout.as_millis() as u64,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => info!(from = %from, "Circuit half-open, probing"),
            CircuitState::Closed => info!(from = %from, "Circuit closed"),
        }

        // No subscribers is fine
        let _ = self.events.send(StateTransition { from, to, at });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> ResilienceError {
        ResilienceError::Transient("test error".to_string())
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_to_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            open_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..3 {
            let result: Result<(), ResilienceError> =
                breaker.call(|| async { Err(transient()) }).await;
            assert!(result.is_err());
        }

        match breaker.get_state().await {
            CircuitState::Open { .. } => (),
            state => panic!("Expected Open state, got {:?}", state),
        }

        assert!(!breaker.allow_request().await);
    }

    #[tokio::test]
    async fn test_success_in_closed_resets_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;

        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        assert_eq!(breaker.get_failure_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_to_half_open_after_timeout() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            open_timeout: Duration::from_millis(1000),
        });

        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert!(breaker.get_state().await.is_open());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!breaker.allow_request().await);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.allow_request().await);
        assert_eq!(breaker.get_state().await, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_to_closed() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            open_timeout: Duration::from_millis(50),
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..2 {
            let _: Result<(), ResilienceError> =
                breaker.call(|| async { Err(transient()) }).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;

        for _ in 0..2 {
            let result = breaker.call(|| async { Ok::<_, ResilienceError>(()) }).await;
            assert!(result.is_ok());
        }

        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        assert_eq!(breaker.get_failure_count().await, 0);
        assert_eq!(breaker.get_success_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 3,
            open_timeout: Duration::from_millis(100),
        });

        breaker.record_failure().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(breaker.allow_request().await);

        breaker.record_success().await;
        breaker.record_success().await;
        breaker.record_failure().await;

        let status = breaker.status().await;
        assert!(status.state.is_open());
        assert_eq!(status.success_count, 0);
        assert!(status.next_attempt.is_some());
    }

    #[tokio::test]
    async fn test_permanent_errors_still_trip_but_backpressure_does_not() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let _: Result<(), _> = breaker
            .call(|| async { Err(ResilienceError::QueueFull { capacity: 1 }) })
            .await;
        assert_eq!(breaker.get_state().await, CircuitState::Closed);

        let _: Result<(), _> = breaker
            .call(|| async { Err(ResilienceError::Permanent("bad".to_string())) })
            .await;
        assert!(breaker.get_state().await.is_open());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        let mut events = breaker.subscribe();

        breaker.record_failure().await;
        breaker.reset().await;

        let opened = events.recv().await.unwrap();
        assert_eq!(opened.from, CircuitState::Closed);
        assert!(opened.to.is_open());

        let closed = events.recv().await.unwrap();
        assert_eq!(closed.to, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);

        let _: Result<(), ResilienceError> = breaker.call(|| async { Err(transient()) }).await;

        breaker.reset().await;

        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        assert_eq!(breaker.get_failure_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_cooldown_stays_open() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_timeout: Duration::MAX,
        });
        assert!(breaker.config().validate().is_ok());

        breaker.record_failure().await;
        assert!(breaker.get_state().await.is_open());

        tokio::time::advance(Duration::from_secs(86400 * 365)).await;
        assert!(!breaker.allow_request().await);

        breaker.reset().await;
        assert!(breaker.allow_request().await);
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());

        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CircuitBreakerConfig {
            success_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
