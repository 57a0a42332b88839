//! Dead-Letter Queue: quarantine for permanently-failed operations
//!
//! When an operation exhausts its retry budget, is classified as
//! non-retryable, or is refused by an open circuit, a [`DeadLetterEntry`] is
//! handed to a [`DeadLetterSink`]. The caller still receives the error; the
//! entry exists for offline inspection and manual replay.
//!
//! # Design
//!
//! The in-memory [`DeadLetterQueue`] is bounded and drops the oldest entry
//! when full. Durable storage (a file, a database) is an external collaborator
//! that implements [`DeadLetterSink`]; this crate never touches it directly.
//!
//! # Example
//!
//! ```
//! use keel_core_resilience::context::OperationContext;
//! use keel_core_resilience::dead_letter::{DeadLetterEntry, DeadLetterQueue, FailureReason};
//!
//! let mut dlq = DeadLetterQueue::new(1000); // max 1000 entries
//!
//! dlq.push(DeadLetterEntry::new(
//!     &OperationContext::new("upload"),
//!     FailureReason::RetriesExhausted { attempts: 5 },
//!     "connection refused",
//!     5,
//! ));
//!
//! assert_eq!(dlq.len(), 1);
//! let entries = dlq.drain();
//! assert_eq!(entries.len(), 1);
//! ```

use crate::context::OperationContext;
use crate::error::ResilienceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Reason an operation was sent to the dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Maximum attempt count reached on a retryable error
    RetriesExhausted { attempts: u32 },

    /// The retry condition refused the error
    NonRetryable,

    /// The circuit breaker refused admission
    CircuitOpen,

    /// A queued task failed on every allowed attempt
    TaskFailed { attempts: u32 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {} attempts", attempts)
            }
            FailureReason::NonRetryable => write!(f, "non-retryable error"),
            FailureReason::CircuitOpen => write!(f, "circuit open"),
            FailureReason::TaskFailed { attempts } => {
                write!(f, "task failed after {} attempts", attempts)
            }
        }
    }
}

/// A single dead-letter entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique ID of this entry
    pub id: String,

    /// Context of the failed operation
    pub context: OperationContext,

    /// Why this operation was dead-lettered
    pub failure_reason: FailureReason,

    /// Last error message
    pub last_error: String,

    /// Attempts consumed before giving up
    pub attempts: u32,

    /// When the entry was created
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        context: &OperationContext,
        failure_reason: FailureReason,
        last_error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            context: context.clone(),
            failure_reason,
            last_error: last_error.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// Destination for dead-letter entries
///
/// Implementations must not block for long: `record` is called on the error
/// path of the caller. A returned error is logged and otherwise ignored.
pub trait DeadLetterSink: Send + Sync {
    fn record(&self, entry: DeadLetterEntry) -> Result<(), ResilienceError>;

    /// Queue statistics, for sinks that keep entries in memory
    fn stats(&self) -> Option<DeadLetterStats> {
        None
    }
}

/// In-memory dead-letter queue with bounded capacity.
///
/// Items that exceed the capacity are dropped (oldest first) to prevent
/// unbounded memory growth. The caller should periodically flush to
/// persistent storage.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: VecDeque<DeadLetterEntry>,
    max_capacity: usize,
    total_received: u64,
    total_dropped: u64,
}

impl DeadLetterQueue {
    /// Create a new dead-letter queue with the given maximum capacity
    pub fn new(max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(max_capacity.min(1024)),
            max_capacity,
            total_received: 0,
            total_dropped: 0,
        }
    }

    /// Push an entry into the dead-letter queue.
    ///
    /// If the queue is at capacity, the oldest entry is dropped.
    pub fn push(&mut self, entry: DeadLetterEntry) {
        self.total_received += 1;

        if self.entries.len() >= self.max_capacity {
            self.entries.pop_front();
            self.total_dropped += 1;
        }

        self.entries.push_back(entry);
    }

    /// Drain all entries from the queue (for flushing to persistent storage)
    pub fn drain(&mut self) -> Vec<DeadLetterEntry> {
        self.entries.drain(..).collect()
    }

    /// Peek at all entries without removing them
    pub fn entries(&self) -> &VecDeque<DeadLetterEntry> {
        &self.entries
    }

    /// Get entries recorded for operations with the given name
    pub fn entries_for_operation(&self, name: &str) -> Vec<&DeadLetterEntry> {
        self.entries
            .iter()
            .filter(|e| e.context.name == name)
            .collect()
    }

    /// Number of entries currently in the queue
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> DeadLetterStats {
        DeadLetterStats {
            current_count: self.entries.len(),
            max_capacity: self.max_capacity,
            total_received: self.total_received,
            total_dropped: self.total_dropped,
        }
    }
}

/// Statistics for the dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    /// Current number of entries
    pub current_count: usize,
    /// Maximum capacity
    pub max_capacity: usize,
    /// Total entries ever received
    pub total_received: u64,
    /// Total entries dropped due to capacity overflow
    pub total_dropped: u64,
}

/// Thread-safe handle to a [`DeadLetterQueue`], usable as a sink
///
/// Clones share the same queue.
#[derive(Debug, Clone)]
pub struct SharedDeadLetterQueue {
    inner: Arc<Mutex<DeadLetterQueue>>,
}

impl SharedDeadLetterQueue {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeadLetterQueue::new(max_capacity))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeadLetterQueue> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        self.lock().drain()
    }

    /// Copy of the current entries, oldest first
    pub fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.lock().entries().iter().cloned().collect()
    }

    pub fn stats(&self) -> DeadLetterStats {
        self.lock().stats()
    }
}

impl Default for SharedDeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DeadLetterSink for SharedDeadLetterQueue {
    fn record(&self, entry: DeadLetterEntry) -> Result<(), ResilienceError> {
        self.lock().push(entry);
        Ok(())
    }

    fn stats(&self) -> Option<DeadLetterStats> {
        Some(SharedDeadLetterQueue::stats(self))
    }
}
