/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{KeelError, Result};

/// The effective level: `verbose` forces DEBUG
pub fn effective_level(config: &LoggingConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

/// Directives used when `RUST_LOG` is not set
///
/// Covers the binary and both workspace crates.
pub fn default_directives(level: Level) -> String {
    format!(
        "keel={level},keel_core_resilience={level},keel_leveler={level}",
        level = level
    )
}

/// Initialize structured logging based on configuration
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let log_level = effective_level(config);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(log_level)))
        .map_err(|e| KeelError::Config(format!("Failed to create log filter: {}", e)))?;

    if let Some(ref log_path) = config.file {
        init_file_logging(log_path, env_filter)?;
    } else {
        init_stdout_logging(env_filter);
    }

    Ok(())
}

/// Initialize logging to stderr
fn init_stdout_logging(env_filter: EnvFilter) {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize logging to a file
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| KeelError::Config(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false) // No ANSI colors in file
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(Level::DEBUG)));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_verbose_overrides_log_level() {
        let config = LoggingConfig {
            level: LogLevel::Error,
            file: None,
            verbose: true,
        };
        assert_eq!(effective_level(&config), Level::DEBUG);
    }

    #[test]
    fn test_level_used_when_not_verbose() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            ..Default::default()
        };
        assert_eq!(effective_level(&config), Level::WARN);
    }

    #[test]
    fn test_default_directives_cover_workspace() {
        let directives = default_directives(Level::INFO);
        assert_eq!(
            directives,
            "keel=INFO,keel_core_resilience=INFO,keel_leveler=INFO"
        );
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("test logging initialized");
    }
}
