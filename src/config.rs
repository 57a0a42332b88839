/*!
 * Configuration file for the keel binary
 *
 * A single TOML document with one table per component. Every key is
 * optional; unknown keys are rejected so typos surface at load time.
 *
 * ```toml
 * [logging]
 * level = "debug"
 *
 * [retry]
 * max_attempts = 5
 * initial_delay_ms = 200
 * strategy = "fibonacci"
 *
 * [retry.circuit_breaker]
 * failure_threshold = 3
 * open_timeout_ms = 10000
 *
 * [leveling]
 * max_queue_size = 200
 * max_rate = 50
 *
 * [dead_letter]
 * capacity = 500
 * file = "/var/lib/keel/dead-letters.jsonl"
 * ```
 */

use crate::error::{KeelError, Result};
use keel_core_resilience::{BackoffConfig, BackoffStrategy, CircuitBreakerConfig, RetryConfig};
use keel_leveler::LevelingPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeelConfig {
    pub logging: LoggingConfig,
    pub retry: RetrySettings,
    pub leveling: LevelingPolicy,
    pub dead_letter: DeadLetterSettings,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Log file path (None = stdout). File output is written as JSON.
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    pub verbose: bool,
}

/// Backoff strategies that can be named in a config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyName {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
}

impl From<StrategyName> for BackoffStrategy {
    fn from(name: StrategyName) -> Self {
        match name {
            StrategyName::Exponential => BackoffStrategy::Exponential,
            StrategyName::Linear => BackoffStrategy::Linear,
            StrategyName::Fixed => BackoffStrategy::Fixed,
            StrategyName::Fibonacci => BackoffStrategy::Fibonacci,
        }
    }
}

/// `[retry]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub strategy: StrategyName,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub use_jitter: bool,
    pub jitter_factor: f64,

    /// Growth factor for the exponential strategy
    pub backoff_multiplier: f64,

    /// Per-attempt deadline; 0 disables it
    pub attempt_timeout_ms: u64,

    pub circuit_breaker: BreakerSettings,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: StrategyName::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            use_jitter: false,
            jitter_factor: 0.1,
            backoff_multiplier: 2.0,
            attempt_timeout_ms: 30_000,
            circuit_breaker: BreakerSettings::default(),
        }
    }
}

impl RetrySettings {
    /// Build the executor configuration these settings describe
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            backoff: BackoffConfig {
                strategy: self.strategy.into(),
                initial_delay: Duration::from_millis(self.initial_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                use_jitter: self.use_jitter,
                jitter_factor: self.jitter_factor,
                multiplier: self.backoff_multiplier,
            },
            attempt_timeout: (self.attempt_timeout_ms > 0)
                .then(|| Duration::from_millis(self.attempt_timeout_ms)),
            circuit_breaker: self.circuit_breaker.to_breaker_config(),
            ..Default::default()
        }
    }
}

/// `[retry.circuit_breaker]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            open_timeout_ms: defaults.open_timeout.as_millis() as u64,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
        }
    }
}

/// `[dead_letter]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeadLetterSettings {
    /// Entries kept by the in-memory queue before the oldest is evicted
    pub capacity: usize,

    /// Append entries to this file as JSON lines instead of keeping them in memory
    pub file: Option<PathBuf>,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            file: None,
        }
    }
}

impl KeelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: KeelConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Check every section against its component's rules
    pub fn validate(&self) -> Result<()> {
        self.retry
            .to_retry_config()
            .validate()
            .map_err(|e| KeelError::Config(format!("[retry] {}", e)))?;
        self.leveling
            .validate()
            .map_err(|e| KeelError::Config(format!("[leveling] {}", e)))?;
        if self.dead_letter.capacity == 0 {
            return Err(KeelError::Config(
                "[dead_letter] capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
