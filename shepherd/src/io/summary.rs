//! Append-only human-readable run summary (`SUMMARY.md`).
//!
//! Every recorded result, stop, clearance and fatal error gets an entry, so an
//! operator can reconstruct what happened without reading the ledger.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::types::{StopRecord, TaskResult};
use crate::io::atomic::write_atomic;

pub const SUMMARY_HEADER: &str = "# Execution Summary\n\n(No execution has occurred yet.)\n\n";

/// Append `entry` as its own paragraph. Existing content is never rewritten.
pub fn append_summary(path: &Path, entry: &str) -> Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let mut contents = if existing.trim().is_empty() {
        SUMMARY_HEADER.to_string()
    } else {
        format!("{}\n\n", existing.trim_end())
    };
    contents.push_str(entry.trim_end());
    contents.push('\n');
    write_atomic(path, contents.as_bytes())
}

pub fn result_entry(result: &TaskResult) -> String {
    let outcome = match result.reason {
        Some(reason) => format!("{} ({})", outcome_label(result), reason.as_str()),
        None => outcome_label(result).to_string(),
    };
    format!(
        "Task {} attempt {}: {outcome}\nFiles changed: {}\nTests run: {}\nNotes: {}\nAt: {}",
        result.task_id,
        result.attempt,
        result.payload.files_changed.len(),
        result.payload.tests_run.len(),
        result.payload.notes,
        result.recorded_at,
    )
}

pub fn stop_entry(record: &StopRecord) -> String {
    let mut entry = format!(
        "STOPPED #{}: {}\nReason: {}\nAt: {}",
        record.seq, record.trigger, record.reason, record.recorded_at
    );
    if let Some(task_id) = &record.snapshot.task_id {
        entry.push_str(&format!("\nTask: {task_id}"));
    }
    entry.push_str(
        "\nAction required: resolve the cause, then run `shepherd clear-stop --note <text>`.",
    );
    entry
}

pub fn clear_entry(stop_seq: u64, note: &str, released: &[String], at: &str) -> String {
    let mut entry = format!("Stop #{stop_seq} cleared: {note}\nAt: {at}");
    if !released.is_empty() {
        entry.push_str(&format!("\nReleased: {}", released.join(", ")));
    }
    entry
}

pub fn fatal_entry(message: &str, at: &str) -> String {
    format!("FATAL: {message}\nAt: {at}")
}

fn outcome_label(result: &TaskResult) -> &'static str {
    match result.outcome {
        crate::core::types::Outcome::Success => "success",
        crate::core::types::Outcome::Failed => "failed",
        crate::core::types::Outcome::Blocked => "blocked",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureReason;
    use crate::test_support::failed_result;

    #[test]
    fn first_entry_gets_header_and_later_entries_append() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("SUMMARY.md");
        append_summary(&path, "first").expect("first");
        append_summary(&path, "second\n").expect("second");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            format!("{SUMMARY_HEADER}first\n\nsecond\n")
        );
    }

    #[test]
    fn result_entry_lists_counts_and_reason() {
        let mut result = failed_result("t1", 2, FailureReason::Timeout);
        result.payload.files_changed = vec!["src/a.rs".to_string()];
        result.payload.notes = "slow".to_string();
        let entry = result_entry(&result);
        assert!(entry.starts_with("Task t1 attempt 2: failed (timeout)\nFiles changed: 1\nTests run: 0\nNotes: slow"));
    }
}
