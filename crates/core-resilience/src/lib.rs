//! Keel Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides building blocks for calling dependencies that fail
//! transiently. It includes:
//!
//! - **Retry Executor**: Sequential attempt loop with per-attempt deadlines
//! - **Circuit Breaker**: Fails fast while a dependency is unhealthy
//! - **Backoff Scheduler**: Exponential, linear, fixed, Fibonacci or custom delays with jitter
//! - **Rate Limiters**: Fixed-window token bucket, sliding-window log, leaky bucket and concurrency cap
//! - **Dead-Letter Queue**: Bounded quarantine for permanently failed operations
//! - **Executor Metrics**: Attempt history and counters for observability
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Storage systems (databases, file systems)
//! - Network protocols
//! - Process-level concerns (configuration files, CLIs)
//!
//! Durable storage for dead-letter entries is injected through the
//! [`DeadLetterSink`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │ execute(op)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Executor                    │  ← Attempt loop
//! │  (deadline per attempt, retry predicate)│
//! └──────┬──────────────────────┬───────────┘
//!        │ allow_request?       │ delay_for(n)
//!        ▼                      ▼
//! ┌──────────────────┐  ┌──────────────────┐
//! │ Circuit Breaker  │  │ Backoff Scheduler│
//! │ (fail-fast gate) │  │ (delay + jitter) │
//! └──────────────────┘  └──────────────────┘
//!               │
//!               ▼
//!         External Service
//!               │
//!       exhausted / non-retryable / circuit open:
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Dead-Letter Sink                  │  ← Permanent failure quarantine
//! │  (bounded in-memory queue, or injected) │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use keel_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let config = RetryConfig {
//!     max_attempts: 4,
//!     backoff: BackoffConfig::network(),
//!     attempt_timeout: Some(Duration::from_secs(5)),
//!     ..Default::default()
//! };
//!
//! let executor = RetryExecutor::try_new(config)?;
//!
//! let result = executor
//!     .execute_with_context(OperationContext::new("fetch-profile"), || async {
//!         // Your potentially failing operation
//!         Ok::<_, ResilienceError>(42)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod context;
pub mod dead_letter;
pub mod error;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;

// Re-export main types for convenience
pub use backoff::{BackoffConfig, BackoffScheduler, BackoffStrategy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStatus, StateTransition,
};
pub use context::OperationContext;
pub use dead_letter::{
    DeadLetterEntry, DeadLetterQueue, DeadLetterSink, DeadLetterStats, FailureReason,
    SharedDeadLetterQueue,
};
pub use error::ResilienceError;
pub use metrics::{AttemptOutcome, AttemptRecord, ExecutorMetrics};
pub use rate_limiter::{
    ConcurrencyLimiter, LeakyBucketRateLimiter, RateLimiter, SlidingWindowRateLimiter,
};
pub use retry::{ExecutorStatus, RetryCondition, RetryConfig, RetryExecutor};

#[cfg(feature = "governor-impl")]
pub use rate_limiter::governor_impl::GovernorRateLimiter;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use keel_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{BackoffConfig, BackoffStrategy};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::context::OperationContext;
    pub use super::dead_letter::{DeadLetterSink, FailureReason, SharedDeadLetterQueue};
    pub use super::error::ResilienceError;
    pub use super::rate_limiter::RateLimiter;
    pub use super::retry::{RetryCondition, RetryConfig, RetryExecutor};
}
