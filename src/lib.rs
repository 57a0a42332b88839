/*!
 * Keel - resilience toolkit
 *
 * The binary side of the workspace:
 * - TOML configuration covering every component
 * - Structured logging setup
 * - A JSON Lines dead-letter sink
 * - Simulated unreliable dependencies and the narrated demo scenarios
 *
 * The mechanisms themselves live in `keel-core-resilience` (retry, circuit
 * breaking, dead-lettering, rate limiting) and `keel-leveler` (queue-based
 * load leveling).
 */

pub mod config;
pub mod demo;
pub mod error;
pub mod logging;
pub mod simulate;
pub mod sink;

// Re-export commonly used types
pub use config::KeelConfig;
pub use error::{KeelError, Result};
pub use sink::JsonLinesSink;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
