//! Retry executor: the attempt loop
//!
//! [`RetryExecutor`] runs an async operation up to `max_attempts` times. Before
//! every attempt it asks the [`CircuitBreaker`] for admission; each attempt runs
//! under an optional deadline; failures are classified by a [`RetryCondition`]
//! and separated by delays from a [`BackoffScheduler`]. Terminal failures are
//! written to a [`DeadLetterSink`] exactly once and then returned to the caller
//! as [`ResilienceError::Operation`] with the last error preserved.
//!
//! Attempts within one call are strictly sequential. Independent calls may
//! share a breaker and a sink by cloning the executor or injecting them.

use crate::backoff::{BackoffConfig, BackoffScheduler};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStatus};
use crate::context::OperationContext;
use crate::dead_letter::{
    DeadLetterEntry, DeadLetterSink, DeadLetterStats, FailureReason, SharedDeadLetterQueue,
};
use crate::error::{ResilienceError, Result};
use crate::metrics::{AttemptOutcome, AttemptRecord, ExecutorMetrics};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Caller-supplied retry predicate: `(error, attempt) -> retry?`
pub type RetryPredicate = Arc<dyn Fn(&ResilienceError, u32) -> bool + Send + Sync>;

/// Decides whether a failed attempt should be retried
#[derive(Clone, Default)]
pub enum RetryCondition {
    /// Retry transient errors (network, timeout, 5xx), never 4xx or validation
    #[default]
    Default,

    /// Caller-defined predicate
    Custom(RetryPredicate),
}

impl RetryCondition {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&ResilienceError, u32) -> bool + Send + Sync + 'static,
    {
        RetryCondition::Custom(Arc::new(f))
    }

    /// Never retry; every failure is terminal
    pub fn never() -> Self {
        Self::custom(|_, _| false)
    }

    pub fn should_retry(&self, error: &ResilienceError, attempt: u32) -> bool {
        match self {
            RetryCondition::Default => error.is_transient(),
            RetryCondition::Custom(f) => f(error, attempt),
        }
    }
}

impl fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryCondition::Default => write!(f, "Default"),
            RetryCondition::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

/// Configuration for a [`RetryExecutor`]
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first (at least 1)
    pub max_attempts: u32,

    /// Delay schedule between attempts
    pub backoff: BackoffConfig,

    /// Deadline for a single attempt; `None` waits indefinitely
    pub attempt_timeout: Option<Duration>,

    /// Configuration for the breaker the executor creates for itself
    pub circuit_breaker: CircuitBreakerConfig,

    pub retry_condition: RetryCondition,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            attempt_timeout: Some(Duration::from_secs(30)),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry_condition: RetryCondition::Default,
        }
    }
}

impl RetryConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }

        if self.attempt_timeout.is_some_and(|t| t.is_zero()) {
            return Err("attempt_timeout must be non-zero".to_string());
        }

        self.backoff.validate()?;
        self.circuit_breaker.validate()?;

        Ok(())
    }
}

/// Snapshot of an executor for dashboards and logs
#[derive(Debug, Clone)]
pub struct ExecutorStatus {
    pub circuit: CircuitStatus,
    pub metrics: ExecutorMetrics,
    /// Present when the sink keeps entries in memory
    pub dead_letters: Option<DeadLetterStats>,
}

/// Runs operations with retries, circuit breaking and dead-lettering
///
/// Cloning is cheap; clones share breaker, sink and metrics.
///
/// # Example
/// ```no_run
/// use keel_core_resilience::{ResilienceError, RetryConfig, RetryExecutor};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let executor = RetryExecutor::try_new(RetryConfig::default())?;
///
///     let value = executor
///         .execute(|| async { Ok::<_, ResilienceError>(42) })
///         .await?;
///
///     assert_eq!(value, 42);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RetryExecutor {
    config: Arc<RetryConfig>,
    scheduler: BackoffScheduler,
    breaker: CircuitBreaker,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<Mutex<ExecutorMetrics>>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Create an executor with its own breaker and in-memory dead-letter queue
    ///
    /// The configuration is not validated; a zero `max_attempts` behaves as 1.
    pub fn new(config: RetryConfig) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        let scheduler = BackoffScheduler::new(config.backoff.clone());

        Self {
            config: Arc::new(config),
            scheduler,
            breaker,
            dead_letters: Arc::new(SharedDeadLetterQueue::default()),
            metrics: Arc::new(Mutex::new(ExecutorMetrics::new())),
        }
    }

    /// Create an executor, rejecting invalid configuration
    pub fn try_new(config: RetryConfig) -> Result<Self> {
        config.validate().map_err(ResilienceError::Config)?;
        Ok(Self::new(config))
    }

    /// Use a shared breaker instead of the executor's own
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// Send terminal failures to `sink` instead of the in-memory queue
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Copy of the current metrics
    pub fn metrics(&self) -> ExecutorMetrics {
        self.lock_metrics().clone()
    }

    pub async fn status(&self) -> ExecutorStatus {
        ExecutorStatus {
            circuit: self.breaker.status().await,
            metrics: self.metrics(),
            dead_letters: self.dead_letters.stats(),
        }
    }

    /// Run `op` under a freshly generated context
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_context(OperationContext::default(), op)
            .await
    }

    /// Run `op`, carrying `ctx` into logs and dead-letter entries
    pub async fn execute_with_context<F, Fut, T>(&self, ctx: OperationContext, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.lock_metrics().record_operation_started();

        let max_attempts = self.config.max_attempts.max(1);
        let mut delay_before = Duration::ZERO;
        let mut attempt = 1u32;

        loop {
            if !self.breaker.allow_request().await {
                let err = ResilienceError::CircuitOpen;
                warn!(
                    operation = %ctx.name,
                    operation_id = %ctx.operation_id,
                    attempt,
                    "Circuit open, rejecting attempt"
                );
                self.record_attempt(AttemptRecord {
                    operation_id: ctx.operation_id.clone(),
                    attempt,
                    outcome: AttemptOutcome::Failure,
                    elapsed: Duration::ZERO,
                    delay_before,
                    circuit_breaker_open: true,
                    timed_out: false,
                    error: Some(err.to_string()),
                });
                self.dead_letter(&ctx, FailureReason::CircuitOpen, &err, attempt);
                self.lock_metrics().record_operation_failed();
                return Err(err);
            }

            debug!(
                operation = %ctx.name,
                operation_id = %ctx.operation_id,
                attempt,
                max_attempts,
                "Starting attempt"
            );

            let started = Instant::now();
            let outcome = match self.config.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(ResilienceError::Timeout(limit)),
                },
                None => op().await,
            };
            let elapsed = started.elapsed();

            let err = match outcome {
                Ok(value) => {
                    self.breaker.record_success().await;
                    self.record_attempt(AttemptRecord {
                        operation_id: ctx.operation_id.clone(),
                        attempt,
                        outcome: AttemptOutcome::Success,
                        elapsed,
                        delay_before,
                        circuit_breaker_open: false,
                        timed_out: false,
                        error: None,
                    });
                    self.lock_metrics().record_operation_succeeded();
                    debug!(
                        operation = %ctx.name,
                        operation_id = %ctx.operation_id,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Operation succeeded"
                    );
                    return Ok(value);
                }
                Err(err) => err,
            };

            // Throttling from the dependency is not a health signal
            if err.should_trip_breaker() {
                self.breaker.record_failure().await;
            }
            self.record_attempt(AttemptRecord {
                operation_id: ctx.operation_id.clone(),
                attempt,
                outcome: AttemptOutcome::Failure,
                elapsed,
                delay_before,
                circuit_breaker_open: false,
                timed_out: matches!(err, ResilienceError::Timeout(_)),
                error: Some(err.to_string()),
            });

            let retryable = self.config.retry_condition.should_retry(&err, attempt);
            if !retryable || attempt >= max_attempts {
                let reason = if retryable {
                    FailureReason::RetriesExhausted { attempts: attempt }
                } else {
                    FailureReason::NonRetryable
                };
                error!(
                    operation = %ctx.name,
                    operation_id = %ctx.operation_id,
                    attempts = attempt,
                    reason = %reason,
                    error = %err,
                    "Operation failed permanently"
                );
                self.dead_letter(&ctx, reason, &err, attempt);
                self.lock_metrics().record_operation_failed();

                return Err(ResilienceError::Operation {
                    operation_id: ctx.operation_id,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            delay_before = self.scheduler.delay_for(attempt);
            warn!(
                operation = %ctx.name,
                operation_id = %ctx.operation_id,
                attempt,
                delay_ms = delay_before.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay_before).await;
            attempt += 1;
        }
    }

    /// Run `op`; on any terminal error return `fallback(error)` instead
    ///
    /// The failure is still dead-lettered and counted.
    pub async fn execute_with_fallback<F, Fut, T, FB>(
        &self,
        ctx: OperationContext,
        op: F,
        fallback: FB,
    ) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(ResilienceError) -> T,
    {
        match self.execute_with_context(ctx, op).await {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "Using fallback");
                fallback(err)
            }
        }
    }

    fn lock_metrics(&self) -> MutexGuard<'_, ExecutorMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_attempt(&self, record: AttemptRecord) {
        self.lock_metrics().record_attempt(record);
    }

    /// Hand a terminal failure to the sink; sink errors are logged, never returned
    fn dead_letter(
        &self,
        ctx: &OperationContext,
        reason: FailureReason,
        err: &ResilienceError,
        attempts: u32,
    ) {
        let entry = DeadLetterEntry::new(ctx, reason, err.to_string(), attempts);
        match self.dead_letters.record(entry) {
            Ok(()) => self.lock_metrics().record_dead_lettered(),
            Err(sink_err) => warn!(
                operation_id = %ctx.operation_id,
                error = %sink_err,
                "Failed to record dead-letter entry"
            ),
        }
    }
}
