//! Progress derived from task and result history.
//!
//! Nothing here is persisted as a source of truth. `PROGRESS.yaml` is a
//! snapshot of [`derive_progress`] and can be deleted at any time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::ledger::StateView;
use crate::core::types::{ObjectiveStatus, TaskStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u32,
    pub dispatched: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub blocked: u32,
}

impl TaskCounts {
    fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Dispatched => self.dispatched += 1,
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Blocked => self.blocked += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.pending + self.dispatched + self.succeeded + self.failed + self.blocked
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveCounts {
    pub pending: u32,
    pub satisfied: u32,
    pub blocked: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub objectives: BTreeMap<String, ObjectiveStatus>,
    pub tasks: BTreeMap<String, TaskStatus>,
    pub objective_counts: ObjectiveCounts,
    pub task_counts: TaskCounts,
    pub results_recorded: usize,
}

impl ProgressState {
    /// Every objective in the plan is satisfied (vacuously false for an empty plan).
    pub fn all_satisfied(&self) -> bool {
        !self.objectives.is_empty()
            && self
                .objectives
                .values()
                .all(|status| *status == ObjectiveStatus::Satisfied)
    }
}

pub fn task_counts(view: &StateView) -> TaskCounts {
    let mut counts = TaskCounts::default();
    for state in view.tasks.values() {
        counts.add(state.status);
    }
    counts
}

/// Objective status from the statuses of its live (non-superseded) tasks.
///
/// Blocked wins over everything; satisfied requires at least one task and
/// every task done (a decomposed task is done when its children are).
pub fn objective_status(view: &StateView, objective_id: &str) -> ObjectiveStatus {
    let superseded = view.plan.superseded();
    let mut any = false;
    let mut all_done = true;
    for task in view
        .plan
        .tasks
        .iter()
        .filter(|task| task.objective == objective_id)
    {
        if superseded.contains(task.id.as_str()) {
            continue;
        }
        any = true;
        if view.status_of(&task.id) == Some(TaskStatus::Blocked) {
            return ObjectiveStatus::Blocked;
        }
        if !view.is_done(&task.id) {
            all_done = false;
        }
    }
    if any && all_done {
        ObjectiveStatus::Satisfied
    } else {
        ObjectiveStatus::Pending
    }
}

pub fn derive_progress(view: &StateView) -> ProgressState {
    let mut progress = ProgressState {
        task_counts: task_counts(view),
        results_recorded: view.results.len(),
        ..ProgressState::default()
    };
    for (id, state) in &view.tasks {
        progress.tasks.insert(id.clone(), state.status);
    }
    for objective in &view.plan.objectives {
        let status = objective_status(view, &objective.id);
        match status {
            ObjectiveStatus::Pending => progress.objective_counts.pending += 1,
            ObjectiveStatus::Satisfied => progress.objective_counts.satisfied += 1,
            ObjectiveStatus::Blocked => progress.objective_counts.blocked += 1,
        }
        progress.objectives.insert(objective.id.clone(), status);
    }
    progress
}
