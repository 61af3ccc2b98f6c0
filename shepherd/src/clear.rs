//! `shepherd clear-stop`: the external intervention that reopens a stopped run.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::io::clock::Clock;
use crate::io::lock::StateLock;
use crate::io::state_store::StateStore;
use crate::io::summary::{append_summary, clear_entry};
use crate::start::Session;

/// Clear the open stop with an operator note, releasing `release` tasks back
/// to pending. Returns the cleared stop's sequence number.
///
/// Holds the state lock, so it cannot race a running daemon.
pub fn clear_stop(root: &Path, note: &str, release: &[String], clock: &dyn Clock) -> Result<u64> {
    let session = Session::open(root)?;
    let paths = &session.paths;
    let _lock = StateLock::acquire(&paths.lock_path)?;
    let mut store = StateStore::open(paths)?;
    let seq = store
        .clear_stop(note, release, clock)
        .context("clear stop")?;
    append_summary(
        &paths.summary_path,
        &clear_entry(seq, note.trim(), release, &clock.timestamp()),
    )?;
    info!(seq, "stop cleared by operator");
    Ok(seq)
}
