//! Leveler Metrics and Status
//!
//! Tracks task counters and timing for an admission queue, and the
//! serializable status snapshot returned by `system_status()`.

use crate::pool::PoolCounts;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifetime counters for one admission queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelerStats {
    /// Tasks accepted by `submit_task`
    pub submitted: u64,

    /// Submissions refused because the queue was full
    pub rejected: u64,

    /// Attempts handed to a worker
    pub dispatched: u64,

    /// Tasks that finished successfully
    pub completed: u64,

    /// Tasks that ran out of attempts
    pub failed: u64,

    /// Failed attempts that were put back in the queue
    pub retried: u64,

    pub scale_ups: u64,

    pub scale_downs: u64,

    /// Summed queue wait across dispatched attempts
    pub total_wait: Duration,

    /// Summed handler time across finished attempts
    pub total_processing: Duration,
}

impl LevelerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of finished tasks that completed (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            1.0 // Nothing finished, nothing failed
        } else {
            self.completed as f64 / finished as f64
        }
    }

    pub fn average_wait(&self) -> Duration {
        average(self.total_wait, self.dispatched)
    }

    pub fn average_processing(&self) -> Duration {
        average(self.total_processing, self.completed + self.failed + self.retried)
    }

    /// Format a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Tasks: {} submitted | {} rejected | {} completed | {} failed ({:.1}% success) | {} retries | Avg wait {:?} | Avg processing {:?}",
            self.submitted,
            self.rejected,
            self.completed,
            self.failed,
            self.success_rate() * 100.0,
            self.retried,
            self.average_wait(),
            self.average_processing()
        )
    }
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

/// Snapshot of an admission queue, for dashboards and the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub running: bool,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub workers: PoolCounts,
    /// Busy workers over pool size (0.0 - 1.0)
    pub utilization: f64,
    pub available_tokens: u32,
    /// Rolling averages from the load monitor
    pub average_queue_size: f64,
    pub average_utilization: f64,
    pub stats: LevelerStats,
}

impl SystemStatus {
    pub fn summary(&self) -> String {
        format!(
            "Queue: {}/{} | Workers: {} ({} busy, {} idle, {} retiring) | Utilization: {:.0}% | Tokens: {} | {}",
            self.queue_size,
            self.queue_capacity,
            self.workers.total,
            self.workers.busy,
            self.workers.idle,
            self.workers.retiring,
            self.utilization * 100.0,
            self.available_tokens,
            self.stats.summary()
        )
    }
}
