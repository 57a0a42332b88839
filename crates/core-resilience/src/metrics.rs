//! Retry executor metrics
//!
//! Counts operations and attempts and keeps a bounded history of recent
//! attempts for dashboards and post-mortems.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Number of attempt records kept before the oldest is discarded
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One attempt of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub operation_id: String,

    /// 1-based attempt number
    pub attempt: u32,

    pub outcome: AttemptOutcome,

    /// Time spent inside the operation (zero when the breaker refused it)
    pub elapsed: Duration,

    /// Backoff applied before this attempt
    pub delay_before: Duration,

    /// The breaker refused admission; the operation never ran
    pub circuit_breaker_open: bool,

    /// The attempt hit its deadline
    pub timed_out: bool,

    pub error: Option<String>,
}

/// Counters and recent history for one executor
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorMetrics {
    /// Calls to `execute` and friends
    pub operations_started: u64,

    /// Operations that eventually returned `Ok`
    pub operations_succeeded: u64,

    /// Operations that surfaced an error to the caller
    pub operations_failed: u64,

    /// Attempts of any outcome, including breaker refusals
    pub total_attempts: u64,

    /// Attempts after the first that reached the operation
    pub retries: u64,

    pub circuit_rejections: u64,

    pub timeouts: u64,

    pub dead_lettered: u64,

    /// Most recent attempts, oldest first
    pub recent_attempts: VecDeque<AttemptRecord>,

    #[serde(skip)]
    history_capacity: usize,
}

impl Default for ExecutorMetrics {
    fn default() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            operations_started: 0,
            operations_succeeded: 0,
            operations_failed: 0,
            total_attempts: 0,
            retries: 0,
            circuit_rejections: 0,
            timeouts: 0,
            dead_lettered: 0,
            recent_attempts: VecDeque::new(),
            history_capacity: capacity.max(1),
        }
    }

    pub fn record_operation_started(&mut self) {
        self.operations_started += 1;
    }

    pub fn record_operation_succeeded(&mut self) {
        self.operations_succeeded += 1;
    }

    pub fn record_operation_failed(&mut self) {
        self.operations_failed += 1;
    }

    pub fn record_dead_lettered(&mut self) {
        self.dead_lettered += 1;
    }

    /// Record one attempt and update the derived counters
    pub fn record_attempt(&mut self, record: AttemptRecord) {
        self.total_attempts += 1;
        if record.attempt > 1 && !record.circuit_breaker_open {
            self.retries += 1;
        }
        if record.circuit_breaker_open {
            self.circuit_rejections += 1;
        }
        if record.timed_out {
            self.timeouts += 1;
        }

        if self.recent_attempts.len() >= self.history_capacity {
            self.recent_attempts.pop_front();
        }
        self.recent_attempts.push_back(record);
    }

    /// Recorded attempts for one operation, oldest first
    ///
    /// Only attempts still inside the history window are returned.
    pub fn attempts_for(&self, operation_id: &str) -> Vec<&AttemptRecord> {
        self.recent_attempts
            .iter()
            .filter(|r| r.operation_id == operation_id)
            .collect()
    }

    /// Fraction of finished operations that succeeded (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let finished = self.operations_succeeded + self.operations_failed;
        if finished == 0 {
            1.0 // Nothing finished, nothing failed
        } else {
            self.operations_succeeded as f64 / finished as f64
        }
    }

    /// Mean attempts per started operation
    pub fn average_attempts(&self) -> f64 {
        if self.operations_started == 0 {
            0.0
        } else {
            self.total_attempts as f64 / self.operations_started as f64
        }
    }

    /// Format a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Operations: {} started | {} ok | {} failed ({:.1}% success) | Attempts: {} ({:.2}/op) | Retries: {} | Circuit rejections: {} | Timeouts: {} | Dead-lettered: {}",
            self.operations_started,
            self.operations_succeeded,
            self.operations_failed,
            self.success_rate() * 100.0,
            self.total_attempts,
            self.average_attempts(),
            self.retries,
            self.circuit_rejections,
            self.timeouts,
            self.dead_lettered
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(op: &str, n: u32, outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            operation_id: op.to_string(),
            attempt: n,
            outcome,
            elapsed: Duration::from_millis(5),
            delay_before: Duration::ZERO,
            circuit_breaker_open: false,
            timed_out: false,
            error: None,
        }
    }

    #[test]
    fn test_success_rate() {
        let mut metrics = ExecutorMetrics::new();

        // Nothing finished
        assert_eq!(metrics.success_rate(), 1.0);

        metrics.record_operation_succeeded();
        metrics.record_operation_succeeded();
        metrics.record_operation_succeeded();
        metrics.record_operation_failed();
        assert_eq!(metrics.success_rate(), 0.75);
    }

    #[test]
    fn test_retries_and_rejections_counted() {
        let mut metrics = ExecutorMetrics::new();
        metrics.record_operation_started();

        metrics.record_attempt(attempt("op", 1, AttemptOutcome::Failure));
        metrics.record_attempt(AttemptRecord {
            timed_out: true,
            ..attempt("op", 2, AttemptOutcome::Failure)
        });
        metrics.record_attempt(AttemptRecord {
            circuit_breaker_open: true,
            ..attempt("op", 3, AttemptOutcome::Failure)
        });

        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.retries, 1);
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.circuit_rejections, 1);
        assert_eq!(metrics.average_attempts(), 3.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut metrics = ExecutorMetrics::with_history_capacity(3);

        for n in 1..=5 {
            metrics.record_attempt(attempt("op", n, AttemptOutcome::Failure));
        }

        assert_eq!(metrics.total_attempts, 5);
        assert_eq!(metrics.recent_attempts.len(), 3);
        assert_eq!(metrics.recent_attempts[0].attempt, 3);
    }

    #[test]
    fn test_attempts_for_filters_by_operation() {
        let mut metrics = ExecutorMetrics::new();
        metrics.record_attempt(attempt("a", 1, AttemptOutcome::Failure));
        metrics.record_attempt(attempt("b", 1, AttemptOutcome::Success));
        metrics.record_attempt(attempt("a", 2, AttemptOutcome::Success));

        let a: Vec<u32> = metrics.attempts_for("a").iter().map(|r| r.attempt).collect();
        assert_eq!(a, vec![1, 2]);
    }

    #[test]
    fn test_summary_and_serialize() {
        let mut metrics = ExecutorMetrics::new();
        metrics.record_operation_started();
        metrics.record_attempt(attempt("op", 1, AttemptOutcome::Success));
        metrics.record_operation_succeeded();

        let summary = metrics.summary();
        assert!(summary.contains("1 started"));
        assert!(summary.contains("100.0% success"));

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["total_attempts"], 1);
        assert_eq!(json["recent_attempts"][0]["outcome"], "success");
        assert!(json.get("history_capacity").is_none());
    }
}
