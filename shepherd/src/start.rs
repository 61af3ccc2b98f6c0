//! Orchestration for `shepherd start`.
//!
//! Startup is strictly ordered: configuration, the state-directory lock, the
//! state store, the open-stop check, the authority store, the tamper check,
//! crash recovery, and only then the dispatch loop. Every path out of here
//! that carries an exit code also leaves a matching `SUMMARY.md` entry.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::types::{StopRecord, StopTrigger, TaskResult};
use crate::dispatch::{DispatchSettings, LoopOutcome, run_dispatch_loop};
use crate::errors::{ShepherdError, classify};
use crate::io::authority::{check_tampering, forbidden_paths, load_authority};
use crate::io::clock::Clock;
use crate::io::config::{ShepherdConfig, load_config};
use crate::io::executor::{Executor, McpExecutor};
use crate::io::lock::StateLock;
use crate::io::paths::ShepherdPaths;
use crate::io::planner::{CommandPlanner, InboxPlanner, Planner};
use crate::io::state_store::{RecoveryAction, StateStore};
use crate::io::summary::{append_summary, fatal_entry, result_entry, stop_entry};

/// A project whose configuration has been read.
#[derive(Debug, Clone)]
pub struct Session {
    pub paths: ShepherdPaths,
    pub config: ShepherdConfig,
}

impl Session {
    /// Read `ai/config.json` and resolve the configured directories.
    pub fn open(root: &Path) -> Result<Self> {
        let config = load_config(&ShepherdPaths::bootstrap_config(root))?;
        let paths = ShepherdPaths::new(root, &config.paths);
        debug!(state_dir = %paths.state_dir.display(), "session opened");
        Ok(Self { paths, config })
    }

    /// Executor spawning `mcp.command` in the project root.
    pub fn executor(&self) -> McpExecutor {
        McpExecutor {
            argv: self.config.mcp.command.argv(),
            workdir: self.paths.root.clone(),
            output_limit_bytes: self.config.execution.output_limit_bytes,
        }
    }

    /// The configured planner command, or the proposal inbox.
    pub fn planner(&self) -> Box<dyn Planner> {
        match &self.config.planner {
            Some(planner) => Box::new(CommandPlanner {
                argv: planner.command.argv(),
                workdir: self.paths.root.clone(),
                timeout: Duration::from_secs(self.config.planner_timeout_seconds()),
                output_limit_bytes: self.config.execution.output_limit_bytes,
            }),
            None => Box::new(InboxPlanner {
                path: self.paths.proposal_path.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A stop record was already open; nothing was touched.
    Refused(StopRecord),
    /// The loop ran.
    Ran(LoopOutcome),
}

/// Run the startup sequence and the dispatch loop with the given collaborators.
///
/// Fatal conditions come back as errors classified by [`ShepherdError`];
/// authority failures found after the state store opened are also recorded
/// as stops.
pub fn start_with<E, P, F>(
    session: &Session,
    executor: &E,
    planner: &P,
    clock: &dyn Clock,
    on_result: F,
) -> Result<StartOutcome>
where
    E: Executor + ?Sized,
    P: Planner + ?Sized,
    F: FnMut(&TaskResult),
{
    let paths = &session.paths;
    let _lock = StateLock::acquire(&paths.lock_path)
        .inspect_err(|err| record_fatal(paths, err, clock))?;

    let mut store = StateStore::open(paths).inspect_err(|err| record_fatal(paths, err, clock))?;
    if let Some(stop) = store.open_stop() {
        warn!(seq = stop.seq, trigger = %stop.trigger, "refusing to start with an open stop");
        append_summary(
            &paths.summary_path,
            &format!(
                "Start refused: stop #{} ({}) is open.\nAt: {}",
                stop.seq,
                stop.trigger,
                clock.timestamp()
            ),
        )?;
        return Ok(StartOutcome::Refused(stop.clone()));
    }

    let authority = match load_authority(paths, clock) {
        Ok(authority) => authority,
        Err(err) => {
            record_authority_stop(&mut store, StopTrigger::AuthorityInvalid, &err, clock)?;
            return Err(err);
        }
    };
    if let Some(baseline) = store.baseline_hashes().cloned()
        && let Err(err) = check_tampering(&baseline, &authority)
    {
        record_authority_stop(&mut store, StopTrigger::AuthorityTampered, &err, clock)?;
        return Err(err);
    }

    if let RecoveryAction::RecordedFailure { task_id, attempt } = store.recover(clock)? {
        info!(task_id = %task_id, attempt, "recovered interrupted dispatch");
        if let Some(result) = store.view().last_result() {
            append_summary(&paths.summary_path, &result_entry(result))?;
        }
    }
    store.record_run_started(authority.immutable_hashes().clone(), clock)?;

    let forbidden = forbidden_paths(paths, &authority);
    let settings = DispatchSettings {
        authority: &authority,
        forbidden: &forbidden,
        limits: session.config.limits(),
        task_timeout: Duration::from_secs(session.config.execution.task_timeout_seconds),
        strict_results: session.config.validation.strict_schema_validation,
    };
    let outcome = run_dispatch_loop(&mut store, &settings, executor, planner, clock, on_result)
        .inspect_err(|err| record_fatal(paths, err, clock))?;
    Ok(StartOutcome::Ran(outcome))
}

/// `shepherd start` with the configured executor and planner.
pub fn start<F: FnMut(&TaskResult)>(
    session: &Session,
    clock: &dyn Clock,
    on_result: F,
) -> Result<StartOutcome> {
    let executor = session.executor();
    let planner = session.planner();
    start_with(session, &executor, planner.as_ref(), clock, on_result)
}

/// Record an authority failure as a stop, so the run cannot resume until an
/// operator clears it.
fn record_authority_stop(
    store: &mut StateStore,
    trigger: StopTrigger,
    err: &anyhow::Error,
    clock: &dyn Clock,
) -> Result<()> {
    let record = store
        .record_stop(trigger, &format!("{err:#}"), clock)
        .context("record authority stop")?;
    append_summary(&store.paths().summary_path, &stop_entry(&record))
}

/// Best-effort summary entry for a fatal error. The error itself is what the
/// caller reports.
pub fn record_fatal(paths: &ShepherdPaths, err: &anyhow::Error, clock: &dyn Clock) {
    let message = match classify(err) {
        Some(ShepherdError::StateCorrupt(_)) => format!("{}: {err:#}", StopTrigger::StateCorrupt),
        _ => format!("{err:#}"),
    };
    if !paths.state_dir.is_dir() {
        return;
    }
    let entry = fatal_entry(&message, &clock.timestamp());
    if let Err(write_err) = append_summary(&paths.summary_path, &entry) {
        warn!(error = %write_err, "could not append fatal entry to summary");
    }
}
