//! Worker pool bookkeeping
//!
//! Workers are slots, not threads: a slot is busy while a tokio task runs a
//! handler on its behalf. The pool only changes size through
//! [`WorkerPool::scale_up`] and [`WorkerPool::scale_down`], which keep the
//! effective size inside `[min_workers, max_workers]`.
//!
//! Scaling down never interrupts a running task. When no worker is idle the
//! chosen busy worker is marked retiring and leaves the pool once its task
//! finishes.

use keel_core_resilience::ResilienceError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    /// Busy, and removed from the pool when its task finishes
    Retiring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: u64,
    pub state: WorkerState,
    pub tasks_processed: u64,
}

/// Counts of workers by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounts {
    /// Workers that count towards the pool size (idle + busy)
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub retiring: usize,
}

#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    min_workers: usize,
    max_workers: usize,
    next_id: u64,
}

impl WorkerPool {
    /// Create a pool of `initial` idle workers, clamped to the bounds.
    ///
    /// Returns `Config` if `min_workers > max_workers` or `max_workers` is zero.
    pub fn new(
        initial: usize,
        min_workers: usize,
        max_workers: usize,
    ) -> Result<Self, ResilienceError> {
        if max_workers == 0 {
            return Err(ResilienceError::Config(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if min_workers > max_workers {
            return Err(ResilienceError::Config(format!(
                "min_workers ({}) cannot exceed max_workers ({})",
                min_workers, max_workers
            )));
        }

        let mut pool = Self {
            workers: Vec::with_capacity(max_workers),
            min_workers,
            max_workers,
            next_id: 1,
        };
        for _ in 0..initial.clamp(min_workers, max_workers) {
            pool.add_worker();
        }
        Ok(pool)
    }

    fn add_worker(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.workers.push(Worker {
            id,
            state: WorkerState::Idle,
            tasks_processed: 0,
        });
        id
    }

    /// Workers that count towards the pool size
    pub fn size(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state != WorkerState::Retiring)
            .count()
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for worker in &self.workers {
            match worker.state {
                WorkerState::Idle => counts.idle += 1,
                WorkerState::Busy => counts.busy += 1,
                WorkerState::Retiring => counts.retiring += 1,
            }
        }
        counts.total = counts.idle + counts.busy;
        counts
    }

    /// Busy workers over pool size (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        let counts = self.counts();
        if counts.total == 0 {
            0.0
        } else {
            counts.busy as f64 / counts.total as f64
        }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Mark an idle worker busy and return its id
    pub fn checkout_idle(&mut self) -> Option<u64> {
        let worker = self
            .workers
            .iter_mut()
            .find(|w| w.state == WorkerState::Idle)?;
        worker.state = WorkerState::Busy;
        Some(worker.id)
    }

    pub fn has_idle(&self) -> bool {
        self.workers.iter().any(|w| w.state == WorkerState::Idle)
    }

    /// Return a worker after its task; retiring workers leave the pool.
    /// Returns true if the worker was removed.
    pub fn release(&mut self, id: u64) -> bool {
        self.check_in(id, true)
    }

    /// Return a worker that was checked out but never given a task
    pub fn release_unused(&mut self, id: u64) -> bool {
        self.check_in(id, false)
    }

    fn check_in(&mut self, id: u64, processed: bool) -> bool {
        let Some(pos) = self.workers.iter().position(|w| w.id == id) else {
            return false;
        };

        let worker = &mut self.workers[pos];
        if processed {
            worker.tasks_processed += 1;
        }

        if worker.state == WorkerState::Retiring {
            self.workers.remove(pos);
            true
        } else {
            worker.state = WorkerState::Idle;
            false
        }
    }

    /// Grow by one worker. A retiring worker is reinstated before a new one
    /// is created. Returns false at `max_workers`.
    pub fn scale_up(&mut self) -> bool {
        if self.size() >= self.max_workers {
            return false;
        }

        if let Some(worker) = self
            .workers
            .iter_mut()
            .find(|w| w.state == WorkerState::Retiring)
        {
            worker.state = WorkerState::Busy;
            return true;
        }

        self.add_worker();
        true
    }

    /// Shrink by one worker, preferring an idle one. Returns false at
    /// `min_workers`.
    pub fn scale_down(&mut self) -> bool {
        if self.size() <= self.min_workers {
            return false;
        }

        if let Some(pos) = self
            .workers
            .iter()
            .rposition(|w| w.state == WorkerState::Idle)
        {
            self.workers.remove(pos);
            return true;
        }

        if let Some(worker) = self
            .workers
            .iter_mut()
            .rev()
            .find(|w| w.state == WorkerState::Busy)
        {
            worker.state = WorkerState::Retiring;
            return true;
        }

        false
    }
}
