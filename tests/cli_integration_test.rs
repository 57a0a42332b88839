/*!
 * End-to-end tests for the keel binary
 *
 * Each test runs the real executable with a small config file so the
 * scenarios finish in milliseconds, then checks exit codes, stdout and the
 * dead-letter file.
 */

use keel::config::KeelConfig;
use keel::sink::read_entries;
use keel_core_resilience::FailureReason;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const FAST_CONFIG: &str = r#"
[retry]
max_attempts = 3
initial_delay_ms = 5
max_delay_ms = 50
attempt_timeout_ms = 200

[retry.circuit_breaker]
failure_threshold = 2
success_threshold = 1
open_timeout_ms = 50

[leveling]
max_rate = 200
process_interval_ms = 5
"#;

fn keel(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_keel"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run keel binary")
}

fn write_config(dir: &TempDir, contents: &str) -> String {
    let path = dir.path().join("keel.toml");
    std::fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_config_prints_effective_defaults() -> anyhow::Result<()> {
    let output = keel(&["config"]);
    assert_eq!(output.status.code(), Some(0));

    let printed = KeelConfig::from_toml_str(&stdout(&output))?;
    assert_eq!(printed, KeelConfig::default());
    Ok(())
}

#[test]
fn test_config_reflects_file_and_flags() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, FAST_CONFIG);
    let dlq = dir.path().join("dlq.jsonl");

    let output = keel(&[
        "--config",
        &config,
        "--dead-letter-file",
        dlq.to_str().unwrap(),
        "config",
    ]);
    assert_eq!(output.status.code(), Some(0));

    let printed = KeelConfig::from_toml_str(&stdout(&output))?;
    assert_eq!(printed.retry.initial_delay_ms, 5);
    assert_eq!(printed.leveling.max_rate, 200);
    assert_eq!(printed.dead_letter.file.as_deref(), Some(dlq.as_path()));
    Ok(())
}

#[test]
fn test_invalid_config_is_fatal() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, "[retry]\nmax_atempts = 3\n");

    let output = keel(&["--config", &config, "config"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to parse configuration"));
    Ok(())
}

#[test]
fn test_retry_recovers() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, FAST_CONFIG);

    let output = keel(&["--config", &config, "retry", "--failures", "2"]);
    assert_eq!(output.status.code(), Some(0));

    let out = stdout(&output);
    assert!(out.contains("attempt 3"));
    assert!(out.contains("payment-service succeeded after 3 call(s)"));
    Ok(())
}

#[test]
fn test_retry_permanent_error_is_dead_lettered() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, FAST_CONFIG);
    let dlq = dir.path().join("dlq.jsonl");

    let output = keel(&[
        "--config",
        &config,
        "--dead-letter-file",
        dlq.to_str().unwrap(),
        "retry",
        "--failures",
        "5",
        "--error",
        "http404",
    ]);
    assert_eq!(output.status.code(), Some(1));

    let entries = read_entries(&dlq)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].failure_reason, FailureReason::NonRetryable);
    assert_eq!(entries[0].attempts, 1);
    assert_eq!(entries[0].context.name, "payment-service");
    Ok(())
}

#[test]
fn test_retry_exhaustion_exit_code() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, FAST_CONFIG);
    let dlq = dir.path().join("dlq.jsonl");

    let output = keel(&[
        "--config",
        &config,
        "--dead-letter-file",
        dlq.to_str().unwrap(),
        "retry",
        "--failures",
        "10",
        "--error",
        "timeout",
        "--attempt-timeout-ms",
        "20",
    ]);
    assert_eq!(output.status.code(), Some(1));

    let entries = read_entries(&dlq)?;
    assert_eq!(
        entries[0].failure_reason,
        FailureReason::RetriesExhausted { attempts: 3 }
    );
    Ok(())
}

#[test]
fn test_breaker_walkthrough_ends_closed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, FAST_CONFIG);

    let output = keel(&["--config", &config, "breaker", "--failures", "2"]);
    assert_eq!(output.status.code(), Some(0));

    let out = stdout(&output);
    assert!(out.contains("closed -> open"));
    assert!(out.contains("open -> half_open"));
    assert!(out.contains("half_open -> closed"));
    assert!(out.trim_end().ends_with("Final state: closed"));
    Ok(())
}

#[test]
fn test_level_reports_status_json() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, FAST_CONFIG);

    let output = keel(&[
        "--config",
        &config,
        "level",
        "--tasks",
        "12",
        "--failure-rate",
        "0",
        "--work-ms",
        "1",
    ]);
    assert_eq!(output.status.code(), Some(0));

    let out = stdout(&output);
    let json_end = out.rfind("\nQueue:").expect("summary line after JSON");
    let status: serde_json::Value = serde_json::from_str(&out[..json_end])?;
    assert_eq!(status["running"], false);
    assert_eq!(status["queue_size"], 0);
    assert_eq!(status["stats"]["submitted"], 12);
    assert_eq!(status["stats"]["completed"], 12);
    Ok(())
}

#[test]
fn test_unwritable_dead_letter_path_fails() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, "").unwrap();
    let dlq = Path::new(&blocker).join("dlq.jsonl");

    let output = keel(&["--dead-letter-file", dlq.to_str().unwrap(), "breaker"]);
    assert_eq!(output.status.code(), Some(1));
}
