/*!
 * Narrated scenarios behind the `retry`, `breaker` and `level` commands
 *
 * Each scenario returns a report instead of printing, so the CLI decides
 * how to present it and tests can assert on it.
 */

use std::sync::Arc;
use std::time::Duration;

use keel_core_resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, DeadLetterSink, ExecutorStatus,
    OperationContext, ResilienceError, RetryConfig, RetryExecutor, StateTransition,
};
use keel_leveler::{AdmissionQueue, LevelingPolicy, SystemStatus};
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{info, warn};

use crate::error::Result;
use crate::simulate::{FailureMode, FlakyHandler, UnreliableService};

/// Outcome of [`run_retry`]
#[derive(Debug)]
pub struct RetryReport {
    pub service: String,
    pub result: std::result::Result<String, ResilienceError>,
    /// Attempts that reached the service or were refused by the breaker
    pub attempts: u32,
    /// Backoff applied before each retry
    pub delays: Vec<Duration>,
    pub status: ExecutorStatus,
}

/// Call a service that fails `failures` times through a retry executor
pub async fn run_retry(
    config: RetryConfig,
    sink: Arc<dyn DeadLetterSink>,
    service: UnreliableService,
) -> Result<RetryReport> {
    let executor = RetryExecutor::try_new(config)?.with_dead_letter_sink(sink);
    let ctx = OperationContext::new(service.name()).with_label("demo", "retry");
    let operation_id = ctx.operation_id.clone();

    info!(
        "🔁 Calling {} | Max attempts: {} | Strategy: {}",
        service.name(),
        executor.config().max_attempts,
        executor.config().backoff.strategy.name()
    );

    let result = executor
        .execute_with_context(ctx, || service.call())
        .await;

    let metrics = executor.metrics();
    let records = metrics.attempts_for(&operation_id);
    let delays = records
        .iter()
        .skip(1)
        .map(|record| record.delay_before)
        .collect();

    Ok(RetryReport {
        service: service.name().to_string(),
        attempts: records.len() as u32,
        delays,
        result,
        status: executor.status().await,
    })
}

/// One guarded call in [`run_breaker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStep {
    pub call: u32,
    pub outcome: String,
    pub state_after: &'static str,
}

/// Outcome of [`run_breaker`]
#[derive(Debug)]
pub struct BreakerReport {
    pub steps: Vec<BreakerStep>,
    pub transitions: Vec<StateTransition>,
    pub final_state: CircuitState,
}

/// Upper bound on guarded calls in one breaker walkthrough
const MAX_BREAKER_CALLS: u32 = 100;

/// Drive a breaker through Closed -> Open -> HalfOpen -> Closed
///
/// Calls the service until it has recovered and the breaker is closed
/// again, waiting out the cooldown whenever the circuit is open.
pub async fn run_breaker(
    config: CircuitBreakerConfig,
    service: UnreliableService,
) -> Result<BreakerReport> {
    config.validate().map_err(ResilienceError::Config)?;
    let cooldown = config.open_timeout;
    let breaker = CircuitBreaker::new(config);
    let mut events = breaker.subscribe();

    let mut steps = Vec::new();
    for call in 1..=MAX_BREAKER_CALLS {
        let outcome = match breaker.call(|| service.call()).await {
            Ok(message) => message,
            Err(ResilienceError::CircuitOpen) => {
                warn!("⚡ Circuit open, waiting {:?} before probing", cooldown);
                tokio::time::sleep(cooldown).await;
                ResilienceError::CircuitOpen.to_string()
            }
            Err(e) => e.to_string(),
        };

        let state = breaker.get_state().await;
        steps.push(BreakerStep {
            call,
            outcome,
            state_after: state.name(),
        });

        if state == CircuitState::Closed && service.failures_remaining() == 0 {
            break;
        }
    }

    let mut transitions = Vec::new();
    loop {
        match events.try_recv() {
            Ok(transition) => transitions.push(transition),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("Missed {} breaker transitions", skipped);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }

    Ok(BreakerReport {
        steps,
        transitions,
        final_state: breaker.get_state().await,
    })
}

/// Options for [`run_level`]
#[derive(Debug, Clone)]
pub struct LevelOptions {
    pub tasks: usize,
    pub failure_rate: f64,
    /// Time each task takes in the handler
    pub work: Duration,
    /// Fixed seed for reproducible failures
    pub seed: Option<u64>,
}

impl Default for LevelOptions {
    fn default() -> Self {
        Self {
            tasks: 50,
            failure_rate: 0.1,
            work: Duration::from_millis(50),
            seed: None,
        }
    }
}

/// Burst `tasks` submissions into an admission queue and let it level them
///
/// Submissions beyond the queue bound are rejected and counted, the way a
/// producer would see backpressure.
pub async fn run_level(
    policy: LevelingPolicy,
    sink: Arc<dyn DeadLetterSink>,
    options: &LevelOptions,
) -> Result<SystemStatus> {
    let handler = Arc::new(match options.seed {
        Some(seed) => FlakyHandler::seeded(options.failure_rate, options.work, seed),
        None => FlakyHandler::new(options.failure_rate, options.work),
    });
    let leveler = AdmissionQueue::with_dead_letter_sink(policy, handler, sink)?;

    leveler.start();

    let mut rejected = 0usize;
    for n in 0..options.tasks {
        let priority = (n % 3) as i32;
        match leveler.submit_task(format!("job-{}", n + 1), priority) {
            Ok(_) => {}
            Err(e) if e.is_backpressure() => rejected += 1,
            Err(e) => return Err(e.into()),
        }
    }
    if rejected > 0 {
        warn!("🚧 {} of {} submissions rejected by backpressure", rejected, options.tasks);
    }

    leveler.wait_until_idle(Duration::from_millis(20)).await;
    leveler.stop().await;

    Ok(leveler.system_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core_resilience::{BackoffConfig, FailureReason, SharedDeadLetterQueue};

    fn retry_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(100),
                ..Default::default()
            },
            attempt_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let dlq = SharedDeadLetterQueue::new(10);
        let service = UnreliableService::new("inventory", 2, FailureMode::Transient);

        let report = run_retry(retry_config(4), Arc::new(dlq.clone()), service)
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(
            report.delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert!(report.result.is_ok());
        assert!(dlq.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timeouts_exhaust_attempts() {
        let dlq = SharedDeadLetterQueue::new(10);
        let service = UnreliableService::new("db", 5, FailureMode::Timeout);

        let report = run_retry(retry_config(3), Arc::new(dlq.clone()), service)
            .await
            .unwrap();

        let err = report.result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(report.status.metrics.timeouts, 3);

        let entries = dlq.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].failure_reason,
            FailureReason::RetriesExhausted { attempts: 3 }
        );
        assert_eq!(entries[0].context.name, "db");
    }

    #[tokio::test]
    async fn test_retry_rejects_invalid_config() {
        let service = UnreliableService::new("svc", 0, FailureMode::Transient);
        let err = run_retry(retry_config(0), Arc::new(SharedDeadLetterQueue::new(1)), service)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_walkthrough() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(1),
        };
        let service = UnreliableService::new("search", 3, FailureMode::Http500);

        let report = run_breaker(config, service).await.unwrap();

        let path: Vec<_> = report
            .transitions
            .iter()
            .map(|t| (t.from.name(), t.to.name()))
            .collect();
        assert_eq!(
            path,
            vec![
                ("closed", "open"),
                ("open", "half_open"),
                ("half_open", "closed"),
            ]
        );
        assert_eq!(report.final_state, CircuitState::Closed);
        // 3 failures, 1 fast rejection, then 2 successful probes
        assert_eq!(report.steps.len(), 6);
        assert_eq!(report.steps[2].state_after, "open");
        assert_eq!(
            report.steps[3].outcome,
            ResilienceError::CircuitOpen.to_string()
        );
        assert_eq!(report.steps[4].state_after, "half_open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_completes_burst() {
        let policy = LevelingPolicy {
            max_queue_size: 100,
            max_rate: 20,
            ..Default::default()
        };
        let options = LevelOptions {
            tasks: 30,
            failure_rate: 0.0,
            work: Duration::from_millis(10),
            seed: Some(1),
        };

        let status = run_level(policy, Arc::new(SharedDeadLetterQueue::new(10)), &options)
            .await
            .unwrap();

        assert!(!status.running);
        assert_eq!(status.queue_size, 0);
        assert_eq!(status.stats.submitted, 30);
        assert_eq!(status.stats.completed, 30);
        assert_eq!(status.stats.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_counts_backpressure() {
        let policy = LevelingPolicy {
            max_queue_size: 5,
            initial_workers: 1,
            min_workers: 1,
            max_workers: 1,
            ..Default::default()
        };
        let options = LevelOptions {
            tasks: 20,
            failure_rate: 0.0,
            work: Duration::from_millis(10),
            seed: Some(1),
        };

        let status = run_level(policy, Arc::new(SharedDeadLetterQueue::new(10)), &options)
            .await
            .unwrap();

        assert_eq!(status.stats.submitted + status.stats.rejected, 20);
        assert!(status.stats.rejected > 0);
        assert_eq!(status.stats.completed, status.stats.submitted);
    }
}
