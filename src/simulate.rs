/*!
 * Simulated dependencies for the demo commands
 *
 * `UnreliableService` fails a fixed number of calls before recovering, the
 * way a database or payment API does during a short outage.
 * `FlakyHandler` fails a random share of leveled tasks.
 */

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keel_core_resilience::ResilienceError;
use keel_leveler::{Task, TaskHandler};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How a simulated call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Connection reset and similar
    Transient,
    /// The call hangs until the attempt deadline cancels it
    Timeout,
    /// 503 Service Unavailable
    Http500,
    /// 404 Not Found
    Http404,
    /// Request rejected by validation
    Permanent,
}

impl FailureMode {
    pub fn error(&self, service: &str) -> ResilienceError {
        match self {
            FailureMode::Transient => {
                ResilienceError::Transient(format!("{} temporarily unavailable", service))
            }
            FailureMode::Timeout => ResilienceError::Timeout(Duration::ZERO),
            FailureMode::Http500 => ResilienceError::Http {
                status: 503,
                message: format!("{} Service Unavailable", service),
            },
            FailureMode::Http404 => ResilienceError::Http {
                status: 404,
                message: format!("{} resource not found", service),
            },
            FailureMode::Permanent => {
                ResilienceError::Permanent(format!("{} rejected the request", service))
            }
        }
    }
}

/// A dependency that fails its first `failures` calls, then succeeds
#[derive(Debug)]
pub struct UnreliableService {
    name: String,
    mode: FailureMode,
    failures_remaining: AtomicU32,
    calls: AtomicU32,
    latency: Duration,
    hang: Duration,
}

impl UnreliableService {
    pub fn new(name: impl Into<String>, failures: u32, mode: FailureMode) -> Self {
        Self {
            name: name.into(),
            mode,
            failures_remaining: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            latency: Duration::from_millis(20),
            hang: Duration::from_secs(3600),
        }
    }

    /// Time every call takes before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// How long a `Timeout` failure hangs before giving up by itself
    pub fn with_hang(mut self, hang: Duration) -> Self {
        self.hang = hang;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failures_remaining(&self) -> u32 {
        self.failures_remaining.load(Ordering::SeqCst)
    }

    pub async fn call(&self) -> Result<String, ResilienceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.latency).await;

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if !failing {
            return Ok(format!("{} succeeded after {} call(s)", self.name, call));
        }

        debug!(service = %self.name, call, mode = ?self.mode, "Simulated failure");
        if self.mode == FailureMode::Timeout {
            tokio::time::sleep(self.hang).await;
            return Err(ResilienceError::Timeout(self.hang));
        }
        Err(self.mode.error(&self.name))
    }
}

/// Task handler that fails a random share of tasks
pub struct FlakyHandler {
    failure_rate: f64,
    work: Duration,
    rng: Mutex<StdRng>,
    handled: AtomicU64,
    failed: AtomicU64,
}

impl FlakyHandler {
    pub fn new(failure_rate: f64, work: Duration) -> Self {
        Self::with_rng(failure_rate, work, StdRng::from_os_rng())
    }

    /// Deterministic failures for a given seed
    pub fn seeded(failure_rate: f64, work: Duration, seed: u64) -> Self {
        Self::with_rng(failure_rate, work, StdRng::seed_from_u64(seed))
    }

    fn with_rng(failure_rate: f64, work: Duration, rng: StdRng) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            work,
            rng: Mutex::new(rng),
            handled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Attempts handled, failed ones included
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler<String> for FlakyHandler {
    async fn handle(&self, task: &Task<String>) -> Result<(), ResilienceError> {
        tokio::time::sleep(self.work).await;
        self.handled.fetch_add(1, Ordering::SeqCst);

        let fail = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_bool(self.failure_rate);

        if fail {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(ResilienceError::Transient(format!(
                "{} failed on attempt {}",
                task.payload, task.attempts
            )));
        }
        Ok(())
    }
}
