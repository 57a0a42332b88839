//! Leveling Policy
//!
//! Defines the capacity, pacing and scaling thresholds for an admission queue.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Load leveling operational policy
///
/// Deserializes from the `[leveling]` section of a configuration file.
/// Missing keys take their defaults and unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LevelingPolicy {
    /// Maximum number of tasks waiting in the queue
    ///
    /// Submissions beyond this fail with `QueueFull`. Tasks re-queued after a
    /// failed attempt do not count against admission.
    ///
    /// **Default:** 1000
    pub max_queue_size: usize,

    /// Dispatch tokens granted per rate window
    ///
    /// **Default:** 10
    pub max_rate: u32,

    /// Length of the rate window in milliseconds
    ///
    /// **Default:** 1000
    pub rate_window_ms: u64,

    /// How often a worker re-checks for a token while the bucket is empty
    ///
    /// **Default:** 10
    pub rate_poll_interval_ms: u64,

    /// Workers created at construction
    ///
    /// **Default:** 2
    pub initial_workers: usize,

    /// Lower bound on the pool size
    ///
    /// **Default:** 1
    pub min_workers: usize,

    /// Upper bound on the pool size
    ///
    /// **Default:** 10
    pub max_workers: usize,

    /// Let the load monitor resize the pool
    ///
    /// **Default:** true
    pub auto_scale: bool,

    /// Load sampling interval in milliseconds
    ///
    /// **Default:** 5000
    pub monitor_interval_ms: u64,

    /// Dispatch tick interval in milliseconds
    ///
    /// **Default:** 100
    pub process_interval_ms: u64,

    /// Average queue size above which the pool may grow
    ///
    /// **Default:** 10.0
    pub scale_up_queue_threshold: f64,

    /// Average queue size below which the pool may shrink
    ///
    /// **Default:** 2.0
    pub scale_down_queue_threshold: f64,

    /// Average utilization above which the pool may grow
    ///
    /// **Default:** 0.8
    pub scale_up_utilization: f64,

    /// Average utilization below which the pool may shrink
    ///
    /// **Default:** 0.3
    pub scale_down_utilization: f64,

    /// Number of samples in the rolling average
    ///
    /// **Default:** 5
    pub lookback_samples: usize,

    /// Attempts per task before it is dead-lettered
    ///
    /// **Default:** 3
    pub max_task_attempts: u32,
}

impl Default for LevelingPolicy {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_rate: 10,
            rate_window_ms: 1000,
            rate_poll_interval_ms: 10,
            initial_workers: 2,
            min_workers: 1,
            max_workers: 10,
            auto_scale: true,
            monitor_interval_ms: 5000,
            process_interval_ms: 100,
            scale_up_queue_threshold: 10.0,
            scale_down_queue_threshold: 2.0,
            scale_up_utilization: 0.8,
            scale_down_utilization: 0.3,
            lookback_samples: 5,
            max_task_attempts: 3,
        }
    }
}

impl LevelingPolicy {
    /// Create a new policy with a custom queue bound
    ///
    /// Other parameters will use defaults.
    pub fn with_queue_size(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            ..Default::default()
        }
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn rate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rate_poll_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    /// Validate the policy configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be at least 1".to_string());
        }

        if self.max_rate == 0 {
            return Err("max_rate must be at least 1".to_string());
        }

        if self.rate_window_ms == 0
            || self.rate_poll_interval_ms == 0
            || self.monitor_interval_ms == 0
            || self.process_interval_ms == 0
        {
            return Err("intervals must be greater than 0".to_string());
        }

        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".to_string());
        }

        if self.min_workers > self.max_workers {
            return Err(format!(
                "min_workers ({}) cannot exceed max_workers ({})",
                self.min_workers, self.max_workers
            ));
        }

        if self.initial_workers < self.min_workers || self.initial_workers > self.max_workers {
            return Err(format!(
                "initial_workers ({}) must be between min_workers ({}) and max_workers ({})",
                self.initial_workers, self.min_workers, self.max_workers
            ));
        }

        if self.scale_down_queue_threshold > self.scale_up_queue_threshold {
            return Err("scale_down_queue_threshold cannot exceed scale_up_queue_threshold".to_string());
        }

        for (name, value) in [
            ("scale_up_utilization", self.scale_up_utilization),
            ("scale_down_utilization", self.scale_down_utilization),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be between 0 and 1, got {}", name, value));
            }
        }

        if self.scale_down_utilization > self.scale_up_utilization {
            return Err("scale_down_utilization cannot exceed scale_up_utilization".to_string());
        }

        if self.lookback_samples == 0 {
            return Err("lookback_samples must be at least 1".to_string());
        }

        if self.max_task_attempts == 0 {
            return Err("max_task_attempts must be at least 1".to_string());
        }

        Ok(())
    }
}
