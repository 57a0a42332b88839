/*!
 * Error types for the keel binary
 */

use keel_core_resilience::ResilienceError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeelError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum KeelError {
    /// Operation, admission or breaker failure from the core crate
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be rendered as TOML
    #[error("Failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KeelError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            KeelError::Config(_) | KeelError::ConfigParse(_) | KeelError::ConfigRender(_) => {
                EXIT_FATAL
            }
            KeelError::Resilience(ResilienceError::Config(_)) => EXIT_FATAL,
            // Operation failures, I/O on sinks and the like
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error means the process could not do any work at all
    pub fn is_fatal(&self) -> bool {
        self.exit_code() == EXIT_FATAL
    }
}
