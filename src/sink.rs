/*!
 * Dead-letter file sink
 *
 * Appends one JSON object per dead-lettered operation to a file, so failed
 * work survives the process and can be inspected or replayed later.
 *
 * ```no_run
 * use keel::sink::JsonLinesSink;
 * use keel_core_resilience::RetryExecutor;
 * use std::path::Path;
 * use std::sync::Arc;
 *
 * let sink = JsonLinesSink::open(Path::new("dead-letters.jsonl")).unwrap();
 * let executor = RetryExecutor::new(Default::default())
 *     .with_dead_letter_sink(Arc::new(sink));
 * ```
 */

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use keel_core_resilience::{DeadLetterEntry, DeadLetterSink, ResilienceError};

use crate::error::Result;

/// Dead-letter sink writing JSON Lines
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open or create `path` in append mode, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeadLetterSink for JsonLinesSink {
    fn record(&self, entry: DeadLetterEntry) -> std::result::Result<(), ResilienceError> {
        let line = serde_json::to_string(&entry)
            .map_err(|e| ResilienceError::Sink(format!("Failed to serialize entry: {}", e)))?;

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", line)
            .and_then(|_| writer.flush())
            .map_err(|e| {
                ResilienceError::Sink(format!("Failed to write {}: {}", self.path.display(), e))
            })
    }
}

/// Read every entry from a JSON Lines dead-letter file, skipping blank lines
pub fn read_entries(path: &Path) -> Result<Vec<DeadLetterEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core_resilience::{FailureReason, OperationContext};
    use tempfile::tempdir;

    fn entry(name: &str, attempts: u32) -> DeadLetterEntry {
        DeadLetterEntry::new(
            &OperationContext::new(name).with_label("region", "eu-west-1"),
            FailureReason::RetriesExhausted { attempts },
            "Transient error: connection reset".to_string(),
            attempts,
        )
    }

    #[test]
    fn test_entries_appended_as_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlq.jsonl");
        let sink = JsonLinesSink::open(&path).unwrap();

        sink.record(entry("charge-card", 3)).unwrap();
        sink.record(entry("send-receipt", 5)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries[0].context.name, "charge-card");
        assert_eq!(entries[1].attempts, 5);
        assert_eq!(
            entries[0].context.labels.get("region").map(String::as_str),
            Some("eu-west-1")
        );
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("dlq.jsonl");

        JsonLinesSink::open(&path)
            .unwrap()
            .record(entry("first", 1))
            .unwrap();
        JsonLinesSink::open(&path)
            .unwrap()
            .record(entry("second", 2))
            .unwrap();

        let names: Vec<_> = read_entries(&path)
            .unwrap()
            .into_iter()
            .map(|e| e.context.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_file_sink_has_no_in_memory_stats() {
        let dir = tempdir().unwrap();
        let sink = JsonLinesSink::open(&dir.path().join("dlq.jsonl")).unwrap();
        assert!(sink.stats().is_none());
    }

    #[test]
    fn test_read_rejects_corrupt_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlq.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();

        assert!(read_entries(&path).is_err());
    }
}
