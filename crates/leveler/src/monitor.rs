//! Load Monitor: rolling-window scaling decisions
//!
//! The monitor is a pure-logic state machine. The daemon feeds it load
//! samples on an interval and applies the decisions it returns; the monitor
//! itself never touches the pool.
//!
//! Decisions are made on the average of the last `lookback` samples, and only
//! once the window is full. After any scaling action the window is cleared, so
//! the next decision reflects the resized pool rather than stale samples.
//!
//! # Example
//!
//! ```
//! use keel_leveler::monitor::{LoadMonitor, LoadSample, ScalingDecision, ScalingThresholds};
//!
//! let mut monitor = LoadMonitor::new(ScalingThresholds::default(), 2);
//!
//! let busy = LoadSample { queue_size: 40, busy_workers: 4, total_workers: 4 };
//! assert_eq!(monitor.observe(busy, 1, 10), ScalingDecision::Hold); // window not full yet
//! assert_eq!(monitor.observe(busy, 1, 10), ScalingDecision::ScaleUp);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Thresholds that gate scaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingThresholds {
    /// Average queue size that must be exceeded to grow
    pub scale_up_queue: f64,
    /// Average queue size that must be undercut to shrink
    pub scale_down_queue: f64,
    /// Average utilization that must be exceeded to grow
    pub scale_up_utilization: f64,
    /// Average utilization that must be undercut to shrink
    pub scale_down_utilization: f64,
}

impl Default for ScalingThresholds {
    fn default() -> Self {
        Self {
            scale_up_queue: 10.0,
            scale_down_queue: 2.0,
            scale_up_utilization: 0.8,
            scale_down_utilization: 0.3,
        }
    }
}

/// One observation of queue and pool load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSample {
    pub queue_size: usize,
    pub busy_workers: usize,
    pub total_workers: usize,
}

impl LoadSample {
    pub fn utilization(&self) -> f64 {
        if self.total_workers == 0 {
            0.0
        } else {
            self.busy_workers as f64 / self.total_workers as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDecision {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Rolling-window load monitor
#[derive(Debug)]
pub struct LoadMonitor {
    thresholds: ScalingThresholds,
    window: VecDeque<LoadSample>,
    lookback: usize,
    samples_seen: u64,
}

impl LoadMonitor {
    pub fn new(thresholds: ScalingThresholds, lookback: usize) -> Self {
        let lookback = lookback.max(1);
        Self {
            thresholds,
            window: VecDeque::with_capacity(lookback),
            lookback,
            samples_seen: 0,
        }
    }

    /// Add a sample, dropping the oldest once the window is full
    pub fn record(&mut self, sample: LoadSample) {
        if self.window.len() >= self.lookback {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.samples_seen += 1;
    }

    pub fn average_queue_size(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: usize = self.window.iter().map(|s| s.queue_size).sum();
        sum as f64 / self.window.len() as f64
    }

    pub fn average_utilization(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.window.iter().map(LoadSample::utilization).sum();
        sum / self.window.len() as f64
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    /// Decide from the current window without recording anything
    ///
    /// `pool_size` is the effective pool size; decisions that would leave
    /// `[min_workers, max_workers]` are turned into `Hold`.
    pub fn decide(&self, pool_size: usize, min_workers: usize, max_workers: usize) -> ScalingDecision {
        if self.window.len() < self.lookback {
            return ScalingDecision::Hold;
        }

        let avg_queue = self.average_queue_size();
        let avg_util = self.average_utilization();
        let t = &self.thresholds;

        if avg_queue > t.scale_up_queue
            && avg_util > t.scale_up_utilization
            && pool_size < max_workers
        {
            ScalingDecision::ScaleUp
        } else if avg_queue < t.scale_down_queue
            && avg_util < t.scale_down_utilization
            && pool_size > min_workers
        {
            ScalingDecision::ScaleDown
        } else {
            ScalingDecision::Hold
        }
    }

    /// Record `sample`, decide, and clear the window after a scaling decision
    pub fn observe(
        &mut self,
        sample: LoadSample,
        min_workers: usize,
        max_workers: usize,
    ) -> ScalingDecision {
        self.record(sample);
        let decision = self.decide(sample.total_workers, min_workers, max_workers);
        if decision != ScalingDecision::Hold {
            self.window.clear();
        }
        decision
    }
}
