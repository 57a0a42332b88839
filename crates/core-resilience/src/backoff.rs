//! Backoff: delay scheduling between retry attempts
//!
//! A [`BackoffScheduler`] turns an attempt number into a delay. It holds no
//! state beyond its configuration, so the same attempt always produces the
//! same base delay; the only randomness is the optional jitter draw.
//!
//! # Strategies
//!
//! | Strategy    | Delay for attempt `n` (1-based)          |
//! |-------------|------------------------------------------|
//! | Exponential | `initial * m^(n-1)`, capped at `max`     |
//! | Linear      | `initial * n`, capped at `max`           |
//! | Fixed       | `initial`                                |
//! | Fibonacci   | `initial * fib(n)`, capped at `max`      |
//! | Custom      | caller-supplied `fn(n) -> Duration`      |
//!
//! `m` is the configured `multiplier`, 2.0 by default.
//!
//! With jitter enabled the final delay is `base + base * factor * u` where
//! `u` is drawn uniformly from `[-1, 1]`, clamped at zero.
//!
//! # Example
//!
//! ```
//! use keel_core_resilience::backoff::{BackoffConfig, BackoffScheduler, BackoffStrategy};
//! use std::time::Duration;
//!
//! let scheduler = BackoffScheduler::new(BackoffConfig {
//!     strategy: BackoffStrategy::Exponential,
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(1),
//!     ..Default::default()
//! });
//!
//! assert_eq!(scheduler.delay_for(1), Duration::from_millis(100));
//! assert_eq!(scheduler.delay_for(3), Duration::from_millis(400));
//! assert_eq!(scheduler.delay_for(10), Duration::from_secs(1));
//! ```

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied delay function
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How the base delay grows with the attempt number
#[derive(Clone, Default)]
pub enum BackoffStrategy {
    /// Delay multiplied by `multiplier` per attempt
    #[default]
    Exponential,

    /// Delay grows by `initial_delay` per attempt
    Linear,

    /// Same delay before every retry
    Fixed,

    /// Delay follows the Fibonacci sequence scaled by `initial_delay`
    Fibonacci,

    /// Delay computed by the caller; not capped
    Custom(DelayFn),
}

impl BackoffStrategy {
    /// Wrap a closure as a custom strategy
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        BackoffStrategy::Custom(Arc::new(f))
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Fibonacci => "fibonacci",
            BackoffStrategy::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffStrategy::Custom(_) => write!(f, "Custom(<function>)"),
            other => f.write_str(other.name()),
        }
    }
}

/// Configuration for delay scheduling
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Growth strategy
    pub strategy: BackoffStrategy,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound for every non-custom strategy
    pub max_delay: Duration,

    /// Randomize each delay around its base value
    pub use_jitter: bool,

    /// Relative spread of the jitter (0.0 - 1.0)
    pub jitter_factor: f64,

    /// Growth factor for the exponential strategy (at least 1.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            use_jitter: false,
            jitter_factor: 0.1,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Short linear delays, for rate-limited dependencies
    pub fn fast() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Long exponential delays, for slow or expensive operations
    pub fn slow() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            ..Default::default()
        }
    }

    /// Jittered exponential delays, for flaky networks
    pub fn network() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            use_jitter: true,
            jitter_factor: 0.5,
            multiplier: 2.0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay > self.max_delay {
            return Err(format!(
                "initial_delay ({:?}) cannot be greater than max_delay ({:?})",
                self.initial_delay, self.max_delay
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be between 0 and 1, got {}",
                self.jitter_factor
            ));
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "multiplier must be a finite number of at least 1.0, got {}",
                self.multiplier
            ));
        }

        Ok(())
    }
}

/// Computes the delay that precedes a given retry attempt
#[derive(Debug, Clone, Default)]
pub struct BackoffScheduler {
    config: BackoffConfig,
}

impl BackoffScheduler {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay for `attempt` (1-based; 0 is treated as 1), jitter included
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);

        if self.config.use_jitter && self.config.jitter_factor > 0.0 {
            let spread: f64 = rand::rng().random_range(-1.0..=1.0);
            apply_jitter(base, self.config.jitter_factor, spread)
        } else {
            base
        }
    }

    /// Delay for `attempt` before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let initial = self.config.initial_delay;
        let max = self.config.max_delay;

        match &self.config.strategy {
            BackoffStrategy::Exponential if self.config.multiplier == 2.0 => {
                let exponent = attempt - 1;
                if exponent >= 32 {
                    return max;
                }
                initial.saturating_mul(1u32 << exponent).min(max)
            }
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * self.config.multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    return max;
                }
                Duration::try_from_secs_f64(secs).unwrap_or(max).min(max)
            }
            BackoffStrategy::Linear => initial.saturating_mul(attempt).min(max),
            BackoffStrategy::Fixed => initial.min(max),
            BackoffStrategy::Fibonacci => initial.saturating_mul(fibonacci(attempt)).min(max),
            BackoffStrategy::Custom(f) => f(attempt),
        }
    }
}

/// `base + base * factor * spread`, clamped to `[0, Duration::MAX]`;
/// `spread` is in `[-1, 1]`
fn apply_jitter(base: Duration, factor: f64, spread: f64) -> Duration {
    let base_secs = base.as_secs_f64();
    let jittered = base_secs + base_secs * factor * spread;
    Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(Duration::MAX)
}

/// fib(1) = 1, fib(2) = 1, fib(3) = 2, ... saturating at u32::MAX
fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (0u32, 1u32);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}
