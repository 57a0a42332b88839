//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Result type for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Errors produced by guarded operations and by the admission layers around them
#[derive(Debug, Error, Clone)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Admission queue is at capacity
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after cooldown")]
    RateLimitExceeded,

    /// Network-class error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Validation-class error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Error reported by an HTTP-style dependency
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// A single attempt exceeded its deadline
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Terminal failure of a retried operation, carrying the last underlying error
    #[error("Operation {operation_id} failed after {attempts} attempt(s): {source}")]
    Operation {
        operation_id: String,
        attempts: u32,
        #[source]
        source: Box<ResilienceError>,
    },

    /// Invalid configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The component has been stopped
    #[error("Component has been shut down")]
    Shutdown,

    /// A dead-letter sink failed to persist an entry
    #[error("Dead-letter sink error: {0}")]
    Sink(String),
}

impl ResilienceError {
    /// Check if this error is transient and can be retried
    ///
    /// Server-side (5xx) HTTP failures are transient, client-side (4xx) are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ResilienceError::Transient(_)
            | ResilienceError::RateLimitExceeded
            | ResilienceError::Timeout(_) => true,
            ResilienceError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        match self {
            ResilienceError::Permanent(_)
            | ResilienceError::CircuitOpen
            | ResilienceError::Config(_)
            | ResilienceError::Operation { .. } => true,
            ResilienceError::Http { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }

    /// Admission-time signals that are not operation outcomes
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen
                | ResilienceError::QueueFull { .. }
                | ResilienceError::RateLimitExceeded
        )
    }

    /// True for a timeout, including a terminal failure whose last attempt timed out
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), ResilienceError::Timeout(_))
    }

    /// Check if this error should contribute to circuit breaker failure count
    pub fn should_trip_breaker(&self) -> bool {
        !self.is_backpressure()
    }

    /// Unwrap terminal `Operation` failures down to the error that caused them
    pub fn root_cause(&self) -> &ResilienceError {
        let mut current = self;
        while let ResilienceError::Operation { source, .. } = current {
            current = source;
        }
        current
    }

    /// Number of attempts consumed, if this is a terminal operation failure
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ResilienceError::Operation { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
