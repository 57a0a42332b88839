//! Task model and the work function contract

use async_trait::async_trait;
use keel_core_resilience::ResilienceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Identifier returned by `submit_task`, unique within one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a task
///
/// `Pending -> Processing -> Completed`, or `Processing -> Pending` again
/// while attempts remain, or `Processing -> Failed` once they run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A unit of queued work
#[derive(Debug, Clone)]
pub struct Task<P> {
    pub id: TaskId,
    pub payload: P,
    /// Higher runs first
    pub priority: i32,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    /// Attempts started so far
    pub attempts: u32,
    pub status: TaskStatus,
}

impl<P> Task<P> {
    pub fn new(id: TaskId, payload: P, priority: i32) -> Self {
        Self {
            id,
            payload,
            priority,
            created_at: Instant::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            status: TaskStatus::Pending,
        }
    }

    /// Move to `Processing` and count the attempt
    pub(crate) fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.status = TaskStatus::Processing;
        self.started_at = Some(Instant::now());
    }

    pub(crate) fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Instant::now());
    }

    pub(crate) fn fail(&mut self) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Instant::now());
    }

    pub(crate) fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
    }

    /// Time spent waiting before the latest attempt started
    pub fn wait_time(&self) -> Option<Duration> {
        self.started_at
            .map(|started| started.saturating_duration_since(self.created_at))
    }

    /// Time spent in the latest attempt
    pub fn processing_time(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(done)) => Some(done.saturating_duration_since(started)),
            _ => None,
        }
    }
}

/// The work function run by pool workers
///
/// A returned error counts as a failed attempt; the task is re-queued while
/// attempts remain.
#[async_trait]
pub trait TaskHandler<P>: Send + Sync {
    async fn handle(&self, task: &Task<P>) -> Result<(), ResilienceError>;
}
