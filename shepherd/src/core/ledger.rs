//! Append-only event ledger and deterministic replay.
//!
//! The ledger is the single source of truth. Every other view of state (task
//! statuses, the active marker, progress counts, the open stop) is produced by
//! folding the entries in order, so crash recovery is a pure function of what
//! was durably committed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::plan::PlanState;
use crate::core::types::{
    ActiveTask, FailureReason, Outcome, StopRecord, TaskResult, TaskStatus,
};

pub const LEDGER_VERSION: u32 = 1;

/// On-disk ledger document (`LEDGER.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ledger {
    pub version: u32,
    pub entries: Vec<LedgerEntry>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Strictly increasing sequence number (1-indexed).
    pub seq: u64,
    /// RFC 3339 UTC timestamp.
    pub at: String,
    #[serde(flatten)]
    pub event: LedgerEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A run passed authority validation. Hashes are the tamper baseline for
    /// the next start.
    RunStarted {
        immutable_hashes: BTreeMap<String, String>,
    },
    /// The planner's plan replaced the previous one wholesale.
    PlanAccepted { plan: PlanState },
    /// A task was handed to the executor.
    Dispatched { task_id: String, attempt: u32 },
    /// The validated (or daemon-imposed) result of the in-flight attempt.
    ResultRecorded { result: TaskResult },
    /// A stop condition fired.
    Stopped { record: StopRecord },
    /// An operator cleared the open stop, optionally releasing failed or
    /// blocked tasks back to pending with a fresh retry budget.
    StopCleared {
        stop_seq: u64,
        note: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        released: Vec<String>,
    },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::PlanAccepted { .. } => "plan_accepted",
            Self::Dispatched { .. } => "dispatched",
            Self::ResultRecorded { .. } => "result_recorded",
            Self::Stopped { .. } => "stopped",
            Self::StopCleared { .. } => "stop_cleared",
        }
    }
}

/// Replayed per-task bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    /// Dispatches so far; the next attempt number is `attempts + 1`.
    pub attempts: u32,
    /// Failed attempts counted against `max_retries_per_task`.
    pub failures: u32,
    /// Ledger seq of the plan that introduced the task.
    pub created_seq: u64,
    /// Position of the task within that plan.
    pub created_index: usize,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<FailureReason>,
}

impl TaskState {
    fn new(created_seq: u64, created_index: usize, at: &str) -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            failures: 0,
            created_seq,
            created_index,
            created_at: at.to_string(),
            updated_at: at.to_string(),
            last_reason: None,
        }
    }

    pub fn has_history(&self) -> bool {
        self.attempts > 0
    }

    /// Total creation order key.
    pub fn created_key(&self) -> (u64, usize) {
        (self.created_seq, self.created_index)
    }
}

/// Current state, derived from the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateView {
    pub plan: PlanState,
    pub plan_seq: Option<u64>,
    pub tasks: BTreeMap<String, TaskState>,
    pub results: Vec<TaskResult>,
    pub active: Option<ActiveTask>,
    pub stop: Option<StopRecord>,
    pub stops_recorded: u64,
    /// Immutable-file hashes recorded at the latest run start (reset when a
    /// stop is cleared, so the next start re-baselines).
    pub baseline_hashes: Option<BTreeMap<String, String>>,
    /// Task ids of consecutive failed results since the last success, block,
    /// or stop clearance.
    pub failure_streak: Vec<String>,
    pub last_seq: u64,
}

/// Fold ledger entries into a [`StateView`].
///
/// Returns a description of the first inconsistency found. Any error means
/// the ledger cannot be trusted and the caller must treat state as corrupt.
pub fn replay(entries: &[LedgerEntry]) -> Result<StateView, String> {
    let mut view = StateView::default();
    for entry in entries {
        view.apply(entry)?;
    }
    Ok(view)
}

impl StateView {
    /// Apply one entry, enforcing ordering and transition rules.
    pub fn apply(&mut self, entry: &LedgerEntry) -> Result<(), String> {
        if entry.seq <= self.last_seq {
            return Err(format!(
                "seq {} does not follow seq {}",
                entry.seq, self.last_seq
            ));
        }
        let seq = entry.seq;
        match &entry.event {
            LedgerEvent::RunStarted { immutable_hashes } => {
                self.baseline_hashes = Some(immutable_hashes.clone());
            }
            LedgerEvent::PlanAccepted { plan } => {
                self.ensure_not_stopped(seq, "plan_accepted")?;
                if let Some(active) = &self.active {
                    return Err(format!(
                        "seq {seq}: plan replaced while '{}' is dispatched",
                        active.task_id
                    ));
                }
                self.replace_plan(seq, &entry.at, plan)?;
            }
            LedgerEvent::Dispatched { task_id, attempt } => {
                self.ensure_not_stopped(seq, "dispatched")?;
                if let Some(active) = &self.active {
                    return Err(format!(
                        "seq {seq}: dispatch of '{task_id}' while '{}' is dispatched",
                        active.task_id
                    ));
                }
                if self.plan.superseded().contains(task_id.as_str()) {
                    return Err(format!("seq {seq}: dispatch of decomposed task '{task_id}'"));
                }
                let state = self
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| format!("seq {seq}: dispatch of unknown task '{task_id}'"))?;
                if !matches!(state.status, TaskStatus::Pending | TaskStatus::Failed) {
                    return Err(format!(
                        "seq {seq}: dispatch of '{task_id}' in status {:?}",
                        state.status
                    ));
                }
                if *attempt != state.attempts + 1 {
                    return Err(format!(
                        "seq {seq}: attempt {attempt} for '{task_id}' does not follow {}",
                        state.attempts
                    ));
                }
                state.status = TaskStatus::Dispatched;
                state.attempts = *attempt;
                state.updated_at = entry.at.clone();
                self.active = Some(ActiveTask {
                    task_id: task_id.clone(),
                    attempt: *attempt,
                    dispatched_at: entry.at.clone(),
                });
            }
            LedgerEvent::ResultRecorded { result } => {
                self.ensure_not_stopped(seq, "result_recorded")?;
                let active = self.active.take().ok_or_else(|| {
                    format!(
                        "seq {seq}: result for '{}' attempt {} with no dispatch in flight",
                        result.task_id, result.attempt
                    )
                })?;
                if active.task_id != result.task_id || active.attempt != result.attempt {
                    return Err(format!(
                        "seq {seq}: result for '{}' attempt {} but '{}' attempt {} is dispatched",
                        result.task_id, result.attempt, active.task_id, active.attempt
                    ));
                }
                let state = self.tasks.get_mut(&result.task_id).ok_or_else(|| {
                    format!("seq {seq}: result for unknown task '{}'", result.task_id)
                })?;
                state.updated_at = entry.at.clone();
                match result.outcome {
                    Outcome::Success => {
                        state.status = TaskStatus::Succeeded;
                        self.failure_streak.clear();
                    }
                    Outcome::Failed => {
                        state.status = TaskStatus::Failed;
                        state.failures += 1;
                        state.last_reason = result.reason;
                        self.failure_streak.push(result.task_id.clone());
                    }
                    Outcome::Blocked => {
                        state.status = TaskStatus::Blocked;
                        self.failure_streak.clear();
                    }
                }
                self.results.push(result.clone());
            }
            LedgerEvent::Stopped { record } => {
                if let Some(open) = &self.stop {
                    return Err(format!(
                        "seq {seq}: stop #{} recorded while stop #{} is open",
                        record.seq, open.seq
                    ));
                }
                if record.seq != self.stops_recorded + 1 {
                    return Err(format!(
                        "seq {seq}: stop #{} does not follow stop #{}",
                        record.seq, self.stops_recorded
                    ));
                }
                self.stops_recorded = record.seq;
                self.stop = Some(record.clone());
            }
            LedgerEvent::StopCleared {
                stop_seq, released, ..
            } => {
                let open = self
                    .stop
                    .take()
                    .ok_or_else(|| format!("seq {seq}: stop cleared but no stop is open"))?;
                if open.seq != *stop_seq {
                    return Err(format!(
                        "seq {seq}: cleared stop #{stop_seq} but stop #{} is open",
                        open.seq
                    ));
                }
                self.baseline_hashes = None;
                self.failure_streak.clear();
                for task_id in released {
                    let state = self.tasks.get_mut(task_id).ok_or_else(|| {
                        format!("seq {seq}: release of unknown task '{task_id}'")
                    })?;
                    if !matches!(state.status, TaskStatus::Failed | TaskStatus::Blocked) {
                        return Err(format!(
                            "seq {seq}: release of '{task_id}' in status {:?}",
                            state.status
                        ));
                    }
                    state.status = TaskStatus::Pending;
                    state.failures = 0;
                    state.last_reason = None;
                    state.updated_at = entry.at.clone();
                }
            }
        }
        self.last_seq = seq;
        Ok(())
    }

    fn ensure_not_stopped(&self, seq: u64, event: &str) -> Result<(), String> {
        match &self.stop {
            Some(stop) => Err(format!(
                "seq {seq}: {event} while stop #{} ({}) is open",
                stop.seq, stop.trigger
            )),
            None => Ok(()),
        }
    }

    fn replace_plan(&mut self, seq: u64, at: &str, plan: &PlanState) -> Result<(), String> {
        for (id, state) in &self.tasks {
            if !state.has_history() {
                continue;
            }
            match plan.task(id) {
                None => {
                    return Err(format!("seq {seq}: plan removes task '{id}' which has history"));
                }
                Some(spec) if self.plan.task(id) != Some(spec) => {
                    return Err(format!(
                        "seq {seq}: plan redefines task '{id}' which has history"
                    ));
                }
                Some(_) => {}
            }
        }

        let mut next = BTreeMap::new();
        for (index, spec) in plan.tasks.iter().enumerate() {
            let state = self
                .tasks
                .remove(&spec.id)
                .unwrap_or_else(|| TaskState::new(seq, index, at));
            if next.insert(spec.id.clone(), state).is_some() {
                return Err(format!("seq {seq}: duplicate task id '{}'", spec.id));
            }
        }
        self.tasks = next;
        self.plan = plan.clone();
        self.plan_seq = Some(seq);
        Ok(())
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|state| state.status)
    }

    pub fn last_result(&self) -> Option<&TaskResult> {
        self.results.last()
    }

    pub fn results_for<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a TaskResult> {
        self.results
            .iter()
            .filter(move |result| result.task_id == task_id)
    }

    /// True when the task succeeded, or was decomposed and every child is done.
    pub fn is_done(&self, task_id: &str) -> bool {
        self.is_done_inner(task_id, 0)
    }

    fn is_done_inner(&self, task_id: &str, depth: usize) -> bool {
        if depth > self.plan.tasks.len() {
            return false;
        }
        if self.status_of(task_id) == Some(TaskStatus::Succeeded) {
            return true;
        }
        let mut children = self.plan.children_of(task_id).peekable();
        if children.peek().is_none() {
            return false;
        }
        children.all(|child| self.is_done_inner(&child.id, depth + 1))
    }
}
