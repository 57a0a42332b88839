//! Rate limiting for preventing downstream overload
//!
//! [`RateLimiter`] is a fixed-window token bucket: `max_tokens` tokens are
//! available per `window`, and the bucket is refilled to exactly `max_tokens`
//! on each window boundary. Tokens never go negative and never exceed the
//! maximum, no matter how many windows pass between calls.
//!
//! Other admission policies:
//!
//! - [`SlidingWindowRateLimiter`]: at most `max_requests` in any trailing
//!   `window`, tracked as a log of admission times. No burst at boundaries.
//! - [`LeakyBucketRateLimiter`]: a bucket of `capacity` that drains one unit
//!   every `leak_interval`; requests are admitted while there is room.
//! - [`ConcurrencyLimiter`]: caps requests in flight rather than requests
//!   per unit of time.
//!
//! With the `governor-impl` feature, [`governor_impl::GovernorRateLimiter`]
//! offers the same surface on top of the `governor` crate's GCRA limiter.

use super::error::ResilienceError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

/// Poll interval used by [`RateLimiter::execute`] while waiting for a token
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    window_start: Instant,
}

/// Rate limiter using token bucket algorithm
///
/// Clones share the same bucket.
///
/// # Example
/// ```no_run
/// use keel_core_resilience::{RateLimiter, ResilienceError};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     // Allow 100 requests per second
///     let limiter = RateLimiter::new(100, Duration::from_secs(1));
///
///     // Execute operation with rate limiting
///     limiter.execute(|| async {
///         Ok::<_, ResilienceError>(42)
///     }).await?;
///
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct RateLimiter {
    max_tokens: u32,
    window: Duration,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Create a new rate limiter with a full bucket
    ///
    /// A zero `max_tokens` is raised to 1 and a zero `window` to 1ms; use
    /// [`RateLimiter::try_new`] to reject them instead.
    pub fn new(max_tokens: u32, window: Duration) -> Self {
        let max_tokens = max_tokens.max(1);
        let window = window.max(Duration::from_millis(1));
        Self {
            max_tokens,
            window,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: max_tokens,
                window_start: Instant::now(),
            })),
        }
    }

    /// Create a rate limiter, rejecting a zero rate or window
    pub fn try_new(max_tokens: u32, window: Duration) -> Result<Self, ResilienceError> {
        check_rate(max_tokens, "max_tokens", window, "window")?;
        Ok(Self::new(max_tokens, window))
    }

    /// Create a rate limiter with requests per second
    pub fn per_second(requests_per_second: u32) -> Self {
        Self::new(requests_per_second, Duration::from_secs(1))
    }

    /// Create a rate limiter with requests per minute
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute, Duration::from_secs(60))
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        bucket
    }

    /// Refill to the maximum if at least one window boundary has passed.
    /// The window grid stays anchored to construction time.
    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.window_start);
        if elapsed < self.window {
            return;
        }

        let into_window = elapsed.as_nanos() % self.window.as_nanos();
        bucket.window_start = now - Duration::from_nanos(into_window as u64);
        bucket.tokens = self.max_tokens;
    }

    /// Take one token if available
    pub fn try_consume(&self) -> bool {
        let mut bucket = self.lock();
        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    /// Wait until a token is available, re-checking every `poll_interval`
    pub async fn acquire(&self, poll_interval: Duration) {
        while !self.try_consume() {
            trace!(
                poll_ms = poll_interval.as_millis() as u64,
                "Rate limit reached, waiting for token"
            );
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Tokens left in the current window
    pub fn available_tokens(&self) -> u32 {
        self.lock().tokens
    }

    /// Execute an operation with rate limiting
    ///
    /// This will wait until a token is available before executing the operation.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        self.acquire(DEFAULT_POLL_INTERVAL).await;
        op().await
    }

    /// Try to execute an operation without waiting
    ///
    /// Returns RateLimitExceeded if rate limit is hit.
    pub async fn try_execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        if !self.try_consume() {
            return Err(ResilienceError::RateLimitExceeded);
        }
        op().await
    }

    /// Get the maximum tokens per window
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Get the refill window
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Reject a zero amount or a zero period
fn check_rate(
    amount: u32,
    what: &str,
    period: Duration,
    period_name: &str,
) -> Result<(), ResilienceError> {
    if amount == 0 {
        return Err(ResilienceError::Config(format!("{} must be at least 1", what)));
    }
    if period.is_zero() {
        return Err(ResilienceError::Config(format!(
            "{} must be non-zero",
            period_name
        )));
    }
    Ok(())
}

/// Sliding-window log: at most `max_requests` admissions in any trailing
/// `window`
///
/// Memory grows with `max_requests`. Clones share the same log.
#[derive(Clone, Debug)]
pub struct SlidingWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    log: Arc<Mutex<VecDeque<Instant>>>,
}

impl SlidingWindowRateLimiter {
    /// Returns `Config` for a zero `max_requests` or `window`
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, ResilienceError> {
        check_rate(max_requests, "max_requests", window, "window")?;
        Ok(Self {
            max_requests,
            window,
            log: Arc::new(Mutex::new(VecDeque::with_capacity(
                (max_requests as usize).min(1024),
            ))),
        })
    }

    /// Drop admissions that fell out of the window ending at `now`
    fn lock(&self, now: Instant) -> MutexGuard<'_, VecDeque<Instant>> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        while log
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= self.window)
        {
            log.pop_front();
        }
        log
    }

    pub fn try_consume(&self) -> bool {
        let now = Instant::now();
        let mut log = self.lock(now);
        if log.len() >= self.max_requests as usize {
            return false;
        }
        log.push_back(now);
        true
    }

    /// Wait until the oldest admission leaves the window
    pub async fn acquire(&self) {
        loop {
            let now = Instant::now();
            let wait = {
                let mut log = self.lock(now);
                if log.len() < self.max_requests as usize {
                    log.push_back(now);
                    return;
                }
                log.front()
                    .and_then(|&oldest| oldest.checked_add(self.window))
                    .map_or(self.window, |free_at| free_at.saturating_duration_since(now))
            };
            trace!(wait_ms = wait.as_millis() as u64, "Sliding window full, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Admissions still available in the current window
    pub fn available(&self) -> u32 {
        let log = self.lock(Instant::now());
        self.max_requests.saturating_sub(log.len() as u32)
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[derive(Debug)]
struct Reservoir {
    level: u32,
    last_leak: Instant,
}

/// Leaky bucket: holds up to `capacity` units and drains one every
/// `leak_interval`
///
/// A full bucket rejects until the next unit drains, so sustained
/// throughput is one request per `leak_interval` after an initial burst of
/// `capacity`. Clones share the same bucket.
#[derive(Clone, Debug)]
pub struct LeakyBucketRateLimiter {
    capacity: u32,
    leak_interval: Duration,
    reservoir: Arc<Mutex<Reservoir>>,
}

impl LeakyBucketRateLimiter {
    /// Returns `Config` for a zero `capacity` or `leak_interval`
    pub fn new(capacity: u32, leak_interval: Duration) -> Result<Self, ResilienceError> {
        check_rate(capacity, "capacity", leak_interval, "leak_interval")?;
        Ok(Self {
            capacity,
            leak_interval,
            reservoir: Arc::new(Mutex::new(Reservoir {
                level: 0,
                last_leak: Instant::now(),
            })),
        })
    }

    fn lock(&self, now: Instant) -> MutexGuard<'_, Reservoir> {
        let mut reservoir = self.reservoir.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(reservoir.last_leak);
        let leaked = elapsed.as_nanos() / self.leak_interval.as_nanos();

        if leaked >= u128::from(reservoir.level) {
            reservoir.level = 0;
            reservoir.last_leak = now;
        } else if leaked > 0 {
            // Partial progress towards the next unit carries over
            let leaked = leaked as u32;
            reservoir.level -= leaked;
            reservoir.last_leak += self.leak_interval * leaked;
        }
        reservoir
    }

    pub fn try_consume(&self) -> bool {
        let mut reservoir = self.lock(Instant::now());
        if reservoir.level >= self.capacity {
            return false;
        }
        reservoir.level += 1;
        true
    }

    /// Wait for room, re-checking every `poll_interval`
    pub async fn acquire(&self, poll_interval: Duration) {
        while !self.try_consume() {
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Units currently in the bucket
    pub fn level(&self) -> u32 {
        self.lock(Instant::now()).level
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Caps the number of operations in flight
///
/// Clones share the same permits.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    permits: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    /// Returns `Config` for a zero `max_concurrent`
    pub fn new(max_concurrent: usize) -> Result<Self, ResilienceError> {
        if max_concurrent == 0 || max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ResilienceError::Config(format!(
                "max_concurrent must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(Self {
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        })
    }

    /// Take a slot without waiting; the slot is returned when the permit drops
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, ResilienceError> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| ResilienceError::RateLimitExceeded)
    }

    /// Wait for a slot
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ResilienceError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ResilienceError::Shutdown)
    }

    /// Run `op` once a slot is free
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        let _permit = self.acquire().await?;
        op().await
    }

    /// Run `op` if a slot is free, otherwise fail with `RateLimitExceeded`
    pub async fn try_execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        let _permit = self.try_acquire()?;
        op().await
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// Rate limiter backed by the governor crate (when feature is enabled)
///
/// Governor refills continuously (GCRA) rather than per window, and reads the
/// system clock, so it does not follow tokio's paused test clock.
#[cfg(feature = "governor-impl")]
pub mod governor_impl {
    use super::*;
    use governor::{
        clock::DefaultClock,
        state::{InMemoryState, NotKeyed},
        Quota, RateLimiter as DirectLimiter,
    };
    use std::num::NonZeroU32;

    /// Rate limiter wrapper using governor
    #[derive(Clone)]
    pub struct GovernorRateLimiter {
        limiter: Arc<DirectLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    }

    impl GovernorRateLimiter {
        /// Create a new governor-based rate limiter allowing bursts of `max_tokens`
        pub fn new(max_tokens: u32, window: Duration) -> Result<Self, ResilienceError> {
            check_rate(max_tokens, "max_tokens", window, "window")?;
            let burst = NonZeroU32::new(max_tokens).ok_or_else(|| {
                ResilienceError::Config("max_tokens must be at least 1".to_string())
            })?;

            // One token is replenished every window / max_tokens
            let too_short = || {
                ResilienceError::Config(format!(
                    "window ({:?}) is shorter than one nanosecond per token ({} tokens)",
                    window, max_tokens
                ))
            };
            let quota = Quota::with_period(window / max_tokens)
                .ok_or_else(too_short)?
                .allow_burst(burst);

            Ok(Self {
                limiter: Arc::new(DirectLimiter::direct(quota)),
            })
        }

        pub fn try_consume(&self) -> bool {
            self.limiter.check().is_ok()
        }

        pub async fn acquire(&self) {
            self.limiter.until_ready().await;
        }

        /// Execute an operation with rate limiting
        pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
        where
            F: FnOnce() -> Fut,
            Fut: std::future::Future<Output = Result<T, ResilienceError>>,
        {
            self.acquire().await;
            op().await
        }

        /// Try to execute without waiting
        pub async fn try_execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
        where
            F: FnOnce() -> Fut,
            Fut: std::future::Future<Output = Result<T, ResilienceError>>,
        {
            if !self.try_consume() {
                return Err(ResilienceError::RateLimitExceeded);
            }
            op().await
        }
    }

}
