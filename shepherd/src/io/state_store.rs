//! State store: the ledger on disk plus derived snapshot files.
//!
//! Every mutation is one ledger event. The event is validated by replaying it
//! onto the current view, the whole ledger is rewritten atomically, and only
//! then are the snapshot files (`PLAN.yaml`, `PROGRESS.yaml`,
//! `ACTIVE_TASK.yaml`, `LAST_RESULT.json`) refreshed. A crash between the two
//! steps leaves stale snapshots that the next start rebuilds.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::ledger::{LEDGER_VERSION, Ledger, LedgerEntry, LedgerEvent, StateView, replay};
use crate::core::plan::{PlanState, TaskSpec};
use crate::core::progress::{ProgressState, derive_progress, objective_status, task_counts};
use crate::core::strict_json::from_strict_str;
use crate::core::types::{
    ActiveTask, FailureReason, ObjectiveStatus, Outcome, ResultPayload, StopRecord, StopSnapshot,
    StopTrigger, TaskResult, TaskStatus,
};
use crate::errors::ShepherdError;
use crate::io::atomic::{remove_if_exists, write_json_atomic};
use crate::io::clock::Clock;
use crate::io::paths::ShepherdPaths;

/// What [`StateStore::recover`] found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// No dispatch was in flight.
    Clean,
    /// A dispatch was in flight with no result; it was recorded as a failed
    /// attempt and will not be re-invoked blindly.
    RecordedFailure { task_id: String, attempt: u32 },
}

#[derive(Debug)]
pub struct StateStore {
    paths: ShepherdPaths,
    ledger: Ledger,
    view: StateView,
}

impl StateStore {
    /// Load and replay the ledger. A missing ledger is an empty history.
    ///
    /// Unparseable or inconsistent ledgers are [`ShepherdError::StateCorrupt`].
    pub fn open(paths: &ShepherdPaths) -> Result<Self> {
        let ledger = match fs::read_to_string(&paths.ledger_path) {
            Ok(raw) => from_strict_str::<Ledger>(&raw).map_err(|err| {
                ShepherdError::StateCorrupt(format!(
                    "parse {}: {err}",
                    paths.ledger_path.display()
                ))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ledger::default(),
            Err(err) => {
                return Err(ShepherdError::StateCorrupt(format!(
                    "read {}: {err}",
                    paths.ledger_path.display()
                ))
                .into());
            }
        };
        if ledger.version != LEDGER_VERSION {
            return Err(ShepherdError::StateCorrupt(format!(
                "unsupported ledger version {} (expected {LEDGER_VERSION})",
                ledger.version
            ))
            .into());
        }
        let view = replay(&ledger.entries).map_err(ShepherdError::StateCorrupt)?;
        debug!(entries = ledger.entries.len(), "ledger replayed");
        Ok(Self {
            paths: paths.clone(),
            ledger,
            view,
        })
    }

    pub fn view(&self) -> &StateView {
        &self.view
    }

    pub fn paths(&self) -> &ShepherdPaths {
        &self.paths
    }

    /// Current plan, derived progress, and the in-flight marker.
    pub fn load(&self) -> (PlanState, ProgressState, Option<ActiveTask>) {
        (
            self.view.plan.clone(),
            derive_progress(&self.view),
            self.view.active.clone(),
        )
    }

    pub fn open_stop(&self) -> Option<&StopRecord> {
        self.view.stop.as_ref()
    }

    /// Most recent stop record, open or cleared.
    pub fn last_stop(&self) -> Option<&StopRecord> {
        self.ledger.entries.iter().rev().find_map(|entry| match &entry.event {
            LedgerEvent::Stopped { record } => Some(record),
            _ => None,
        })
    }

    /// Baseline immutable-file hashes from the last run start since the last
    /// stop clearance.
    pub fn baseline_hashes(&self) -> Option<&BTreeMap<String, String>> {
        self.view.baseline_hashes.as_ref()
    }

    pub fn record_run_started(
        &mut self,
        immutable_hashes: BTreeMap<String, String>,
        clock: &dyn Clock,
    ) -> Result<()> {
        self.commit(LedgerEvent::RunStarted { immutable_hashes }, clock)
    }

    /// Replace the plan wholesale. Refused while a stop is open.
    pub fn accept_plan(&mut self, plan: PlanState, clock: &dyn Clock) -> Result<()> {
        self.ensure_not_stopped()?;
        let tasks = plan.tasks.len();
        self.commit(LedgerEvent::PlanAccepted { plan }, clock)?;
        info!(tasks, "plan accepted");
        Ok(())
    }

    /// Record `task_id` as dispatched and persist the active marker.
    ///
    /// Fails with [`ShepherdError::Concurrency`] if any task is already in flight.
    pub fn begin_dispatch(&mut self, task_id: &str, clock: &dyn Clock) -> Result<ActiveTask> {
        self.ensure_not_stopped()?;
        if let Some(active) = &self.view.active {
            return Err(ShepherdError::Concurrency(format!(
                "cannot dispatch '{task_id}': '{}' attempt {} is in flight",
                active.task_id, active.attempt
            ))
            .into());
        }
        let attempt = self
            .view
            .tasks
            .get(task_id)
            .map(|state| state.attempts + 1)
            .ok_or_else(|| anyhow!("cannot dispatch unknown task '{task_id}'"))?;
        self.commit(
            LedgerEvent::Dispatched {
                task_id: task_id.to_string(),
                attempt,
            },
            clock,
        )?;
        self.view
            .active
            .clone()
            .ok_or_else(|| anyhow!("dispatch of '{task_id}' left no active marker"))
    }

    /// Append the result for the in-flight attempt, updating status and
    /// progress and clearing the marker in one commit.
    pub fn apply_result(&mut self, result: TaskResult, clock: &dyn Clock) -> Result<()> {
        self.apply_result_with(result, clock, |_| None).map(|_| ())
    }

    /// Like [`apply_result`](Self::apply_result), but `decide` sees the view
    /// with the result applied and may return a stop. The result and the stop
    /// land in the same ledger write, so a crash cannot keep one without the
    /// other.
    pub fn apply_result_with<D>(
        &mut self,
        result: TaskResult,
        clock: &dyn Clock,
        decide: D,
    ) -> Result<Option<StopRecord>>
    where
        D: FnOnce(&StateView) -> Option<(StopTrigger, String)>,
    {
        self.ensure_not_stopped()?;
        let in_flight = self
            .view
            .active
            .as_ref()
            .is_some_and(|active| {
                active.task_id == result.task_id && active.attempt == result.attempt
            });
        if !in_flight {
            return Err(ShepherdError::Schema(format!(
                "stale result for '{}' attempt {}",
                result.task_id, result.attempt
            ))
            .into());
        }
        let mut after = self.view.clone();
        after
            .apply(&LedgerEntry {
                seq: self.view.last_seq + 1,
                at: clock.timestamp(),
                event: LedgerEvent::ResultRecorded {
                    result: result.clone(),
                },
            })
            .map_err(|err| anyhow!("ledger refused result_recorded event: {err}"))?;
        let record = decide(&after)
            .map(|(trigger, reason)| stop_record(&after, trigger, &reason, clock));

        let mut events = vec![LedgerEvent::ResultRecorded { result }];
        if let Some(record) = &record {
            events.push(LedgerEvent::Stopped {
                record: record.clone(),
            });
        }
        self.commit_all(events, clock)?;
        if let Some(record) = &record {
            warn!(
                seq = record.seq,
                trigger = %record.trigger,
                reason = %record.reason,
                "stop recorded"
            );
        }
        Ok(record)
    }

    /// Resolve a dispatch left open by a crash. Idempotent.
    pub fn recover(&mut self, clock: &dyn Clock) -> Result<RecoveryAction> {
        let Some(active) = self.view.active.clone() else {
            return Ok(RecoveryAction::Clean);
        };
        warn!(
            task_id = %active.task_id,
            attempt = active.attempt,
            "found dispatch without result; recording crash-recovery failure"
        );
        let result = TaskResult {
            task_id: active.task_id.clone(),
            attempt: active.attempt,
            outcome: Outcome::Failed,
            reason: Some(FailureReason::CrashRecovery),
            payload: ResultPayload {
                notes: format!(
                    "daemon stopped while attempt {} was in flight (dispatched {})",
                    active.attempt, active.dispatched_at
                ),
                ..ResultPayload::default()
            },
            recorded_at: clock.timestamp(),
        };
        self.apply_result(result, clock)?;
        Ok(RecoveryAction::RecordedFailure {
            task_id: active.task_id,
            attempt: active.attempt,
        })
    }

    /// Record a stop. Any later mutation other than clearing is refused.
    pub fn record_stop(
        &mut self,
        trigger: StopTrigger,
        reason: &str,
        clock: &dyn Clock,
    ) -> Result<StopRecord> {
        if let Some(open) = &self.view.stop {
            return Err(ShepherdError::Stop {
                seq: open.seq,
                trigger: open.trigger,
                reason: open.reason.clone(),
            }
            .into());
        }
        let record = stop_record(&self.view, trigger, reason, clock);
        self.commit(
            LedgerEvent::Stopped {
                record: record.clone(),
            },
            clock,
        )?;
        warn!(seq = record.seq, trigger = %trigger, reason, "stop recorded");
        Ok(record)
    }

    /// External clearing of the open stop. `release` returns failed or
    /// blocked tasks to pending with a fresh retry budget.
    pub fn clear_stop(&mut self, note: &str, release: &[String], clock: &dyn Clock) -> Result<u64> {
        let stop_seq = self
            .view
            .stop
            .as_ref()
            .map(|stop| stop.seq)
            .ok_or_else(|| anyhow!("no stop is open"))?;
        if note.trim().is_empty() {
            return Err(anyhow!("a note describing the intervention is required"));
        }
        self.commit(
            LedgerEvent::StopCleared {
                stop_seq,
                note: note.trim().to_string(),
                released: release.to_vec(),
            },
            clock,
        )?;
        info!(stop_seq, released = release.len(), "stop cleared");
        Ok(stop_seq)
    }

    /// Rewrite every snapshot file from the current view.
    pub fn refresh_snapshots(&self) -> Result<()> {
        write_json_atomic(&self.paths.plan_path, &PlanSnapshot::from_view(&self.view))?;
        write_json_atomic(&self.paths.progress_path, &derive_progress(&self.view))?;
        match &self.view.active {
            Some(active) => {
                let snapshot = ActiveSnapshot {
                    task: self.view.plan.task(&active.task_id),
                    active,
                };
                write_json_atomic(&self.paths.active_task_path, &snapshot)?;
            }
            None => remove_if_exists(&self.paths.active_task_path)?,
        }
        match self.view.last_result() {
            Some(result) => write_json_atomic(&self.paths.last_result_path, result)?,
            None => remove_if_exists(&self.paths.last_result_path)?,
        }
        Ok(())
    }

    fn ensure_not_stopped(&self) -> Result<()> {
        match &self.view.stop {
            Some(stop) => Err(ShepherdError::Stop {
                seq: stop.seq,
                trigger: stop.trigger,
                reason: stop.reason.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    fn commit(&mut self, event: LedgerEvent, clock: &dyn Clock) -> Result<()> {
        self.commit_all(vec![event], clock)
    }

    /// Validate and append `events` with a single atomic ledger rewrite.
    fn commit_all(&mut self, events: Vec<LedgerEvent>, clock: &dyn Clock) -> Result<()> {
        let at = clock.timestamp();
        let mut next = self.view.clone();
        let mut entries = Vec::with_capacity(events.len());
        for event in events {
            let entry = LedgerEntry {
                seq: next.last_seq + 1,
                at: at.clone(),
                event,
            };
            next.apply(&entry)
                .map_err(|err| anyhow!("ledger refused {} event: {err}", entry.event.name()))?;
            entries.push(entry);
        }

        let committed = self.ledger.entries.len();
        let names: Vec<&'static str> = entries.iter().map(|entry| entry.event.name()).collect();
        self.ledger.entries.extend(entries);
        if let Err(err) = write_json_atomic(&self.paths.ledger_path, &self.ledger) {
            self.ledger.entries.truncate(committed);
            return Err(err).context("commit ledger");
        }
        self.view = next;
        debug!(seq = self.view.last_seq, events = ?names, "ledger committed");
        self.refresh_snapshots()
    }
}

/// Stop record capturing `view` at the moment the stop fires.
fn stop_record(
    view: &StateView,
    trigger: StopTrigger,
    reason: &str,
    clock: &dyn Clock,
) -> StopRecord {
    let snapshot = StopSnapshot {
        task_id: view
            .active
            .as_ref()
            .map(|active| active.task_id.clone())
            .or_else(|| view.last_result().map(|result| result.task_id.clone())),
        active: view.active.clone(),
        last_result: view.last_result().cloned(),
        task_counts: task_counts(view),
    };
    StopRecord {
        seq: view.stops_recorded + 1,
        trigger,
        reason: reason.to_string(),
        snapshot,
        recorded_at: clock.timestamp(),
    }
}

#[derive(Serialize)]
struct PlanSnapshot<'a> {
    version: u32,
    objectives: Vec<ObjectiveSnapshot<'a>>,
    tasks: Vec<TaskSnapshot<'a>>,
}

#[derive(Serialize)]
struct ObjectiveSnapshot<'a> {
    id: &'a str,
    description: &'a str,
    sources: &'a [String],
    status: ObjectiveStatus,
}

#[derive(Serialize)]
struct TaskSnapshot<'a> {
    #[serde(flatten)]
    spec: &'a TaskSpec,
    status: TaskStatus,
    attempts: u32,
    superseded: bool,
}

impl<'a> PlanSnapshot<'a> {
    fn from_view(view: &'a StateView) -> Self {
        let superseded = view.plan.superseded();
        Self {
            version: view.plan.version,
            objectives: view
                .plan
                .objectives
                .iter()
                .map(|objective| ObjectiveSnapshot {
                    id: &objective.id,
                    description: &objective.description,
                    sources: &objective.sources,
                    status: objective_status(view, &objective.id),
                })
                .collect(),
            tasks: view
                .plan
                .tasks
                .iter()
                .map(|spec| {
                    let state = view.tasks.get(&spec.id);
                    TaskSnapshot {
                        spec,
                        status: state.map_or(TaskStatus::Pending, |state| state.status),
                        attempts: state.map_or(0, |state| state.attempts),
                        superseded: superseded.contains(spec.id.as_str()),
                    }
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct ActiveSnapshot<'a> {
    #[serde(flatten)]
    active: &'a ActiveTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'a TaskSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::classify;
    use crate::test_support::{FixedClock, Workspace, plan_with_tasks, success_result};

    fn store_with_plan(ws: &Workspace, clock: &FixedClock) -> StateStore {
        let mut store = StateStore::open(&ws.paths()).expect("open");
        store
            .accept_plan(plan_with_tasks(&["t1", "t2"]), clock)
            .expect("accept");
        store
    }

    #[test]
    fn dispatch_persists_marker_and_result_clears_it() {
        let ws = Workspace::new();
        let clock = FixedClock::default();
        let mut store = store_with_plan(&ws, &clock);
        let paths = ws.paths();

        let active = store.begin_dispatch("t1", &clock).expect("dispatch");
        assert_eq!(active.attempt, 1);
        assert!(paths.active_task_path.exists());

        let reopened = StateStore::open(&paths).expect("reopen");
        assert_eq!(reopened.view().active.as_ref(), Some(&active));

        store
            .apply_result(success_result("t1", 1), &clock)
            .expect("apply");
        assert!(!paths.active_task_path.exists());
        assert!(paths.last_result_path.exists());
        let (_, progress, active) = StateStore::open(&paths).expect("reopen").load();
        assert!(active.is_none());
        assert_eq!(progress.task_counts.succeeded, 1);
    }

    #[test]
    fn second_dispatch_is_a_concurrency_error() {
        let ws = Workspace::new();
        let clock = FixedClock::default();
        let mut store = store_with_plan(&ws, &clock);
        store.begin_dispatch("t1", &clock).expect("dispatch");
        let err = store.begin_dispatch("t2", &clock).unwrap_err();
        assert!(matches!(classify(&err), Some(ShepherdError::Concurrency(_))));
        assert_eq!(store.view().status_of("t2"), Some(TaskStatus::Pending));
    }

    #[test]
    fn stale_result_is_rejected_without_state_change() {
        let ws = Workspace::new();
        let clock = FixedClock::default();
        let mut store = store_with_plan(&ws, &clock);
        store.begin_dispatch("t1", &clock).expect("dispatch");
        let before = store.view().clone();
        let err = store
            .apply_result(success_result("t1", 2), &clock)
            .unwrap_err();
        assert!(matches!(classify(&err), Some(ShepherdError::Schema(_))));
        assert_eq!(store.view(), &before);
    }

    /// Recovery after a crash mid-dispatch records one failure, and running it
    /// again finds nothing to do.
    #[test]
    fn recover_is_idempotent() {
        let ws = Workspace::new();
        let clock = FixedClock::default();
        {
            let mut store = store_with_plan(&ws, &clock);
            store.begin_dispatch("t1", &clock).expect("dispatch");
        }

        let mut store = StateStore::open(&ws.paths()).expect("reopen");
        let action = store.recover(&clock).expect("recover");
        assert_eq!(
            action,
            RecoveryAction::RecordedFailure {
                task_id: "t1".to_string(),
                attempt: 1
            }
        );
        let state = &store.view().tasks["t1"];
        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(state.last_reason, Some(FailureReason::CrashRecovery));

        let mut store = StateStore::open(&ws.paths()).expect("reopen again");
        assert_eq!(store.recover(&clock).expect("recover"), RecoveryAction::Clean);
        assert_eq!(store.view().results.len(), 1);
        assert_eq!(
            store.begin_dispatch("t1", &clock).expect("redispatch").attempt,
            2
        );
    }

    #[test]
    fn result_and_its_stop_share_one_commit() {
        let ws = Workspace::new();
        let clock = FixedClock::default();
        let mut store = store_with_plan(&ws, &clock);
        store.begin_dispatch("t1", &clock).expect("dispatch");

        let mut blocked = success_result("t1", 1);
        blocked.outcome = Outcome::Blocked;
        let record = store
            .apply_result_with(blocked, &clock, |after| {
                assert!(after.active.is_none());
                assert_eq!(after.status_of("t1"), Some(TaskStatus::Blocked));
                Some((StopTrigger::ExecutorBlocked, "needs credentials".to_string()))
            })
            .expect("apply")
            .expect("stop");
        assert_eq!(record.seq, 1);
        assert_eq!(record.snapshot.task_id.as_deref(), Some("t1"));

        let reopened = StateStore::open(&ws.paths()).expect("reopen");
        let events: Vec<_> = reopened
            .ledger
            .entries
            .iter()
            .map(|entry| entry.event.name())
            .collect();
        assert_eq!(
            events,
            vec!["plan_accepted", "dispatched", "result_recorded", "stopped"]
        );
        assert_eq!(reopened.open_stop(), Some(&record));
    }

    #[test]
    fn refused_result_commits_neither_event() {
        let ws = Workspace::new();
        let clock = FixedClock::default();
        let mut store = store_with_plan(&ws, &clock);
        store.begin_dispatch("t1", &clock).expect("dispatch");
        let before = store.view().clone();

        let err = store
            .apply_result_with(success_result("t2", 1), &clock, |_| {
                Some((StopTrigger::ExecutorBlocked, "unused".to_string()))
            })
            .unwrap_err();

        assert!(matches!(classify(&err), Some(ShepherdError::Schema(_))));
        assert_eq!(store.view(), &before);
        assert!(StateStore::open(&ws.paths()).expect("reopen").open_stop().is_none());
    }

    #[test]
    fn open_stop_blocks_mutations_until_cleared() {
        let ws = Workspace::new();
        let clock = FixedClock::default();
        let mut store = store_with_plan(&ws, &clock);
        let record = store
            .record_stop(StopTrigger::PlannerConflict, "docs disagree", &clock)
            .expect("stop");
        assert_eq!(record.seq, 1);

        let err = store.begin_dispatch("t1", &clock).unwrap_err();
        assert!(matches!(classify(&err), Some(ShepherdError::Stop { seq: 1, .. })));
        assert!(store.accept_plan(plan_with_tasks(&["t1"]), &clock).is_err());
        assert!(
            store
                .record_stop(StopTrigger::PlanInvalid, "again", &clock)
                .is_err()
        );

        assert!(store.clear_stop("  ", &[], &clock).is_err());
        assert_eq!(store.clear_stop("reconciled docs", &[], &clock).expect("clear"), 1);
        store.begin_dispatch("t1", &clock).expect("dispatch after clear");
        let next = store
            .record_stop(StopTrigger::InvariantViolated, "x", &clock)
            .expect("second stop");
        assert_eq!(next.seq, 2);
        assert_eq!(next.snapshot.task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn corrupt_ledger_is_state_corrupt() {
        let ws = Workspace::new();
        ws.write("ai/LEDGER.json", "{\"version\": 1, \"entries\": [}");
        let err = StateStore::open(&ws.paths()).unwrap_err();
        assert!(matches!(classify(&err), Some(ShepherdError::StateCorrupt(_))));

        ws.write(
            "ai/LEDGER.json",
            r#"{"version": 1, "entries": [{"seq": 1, "at": "t", "event": "dispatched", "task_id": "t1", "attempt": 1}]}"#,
        );
        let err = StateStore::open(&ws.paths()).unwrap_err();
        assert!(format!("{err:#}").contains("unknown task 't1'"));
    }

    #[test]
    fn snapshots_describe_plan_with_derived_status() {
        let ws = Workspace::new();
        let clock = FixedClock::default();
        let mut store = store_with_plan(&ws, &clock);
        store.begin_dispatch("t1", &clock).expect("dispatch");
        let plan: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(&ws.paths().plan_path).expect("read plan"),
        )
        .expect("parse plan");
        assert_eq!(plan["tasks"][0]["id"], "t1");
        assert_eq!(plan["tasks"][0]["status"], "dispatched");
        assert_eq!(plan["tasks"][1]["status"], "pending");
        assert_eq!(plan["objectives"][0]["status"], "pending");

        let active: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(&ws.paths().active_task_path).expect("read active"),
        )
        .expect("parse active");
        assert_eq!(active["task_id"], "t1");
        assert_eq!(active["task"]["id"], "t1");
    }
}
