//! Consistency checks over replayed state.
//!
//! Replay already refuses illegal transitions; these checks catch state that
//! is individually legal but globally inconsistent. Any finding stops the loop.

use crate::core::ledger::StateView;
use crate::core::types::{Outcome, TaskStatus};

/// Returns stable error messages (empty on success).
pub fn check_invariants(view: &StateView) -> Vec<String> {
    let mut errors = Vec::new();

    let dispatched: Vec<&str> = view
        .tasks
        .iter()
        .filter(|(_, state)| state.status == TaskStatus::Dispatched)
        .map(|(id, _)| id.as_str())
        .collect();
    if dispatched.len() > 1 {
        errors.push(format!(
            "more than one task dispatched: {}",
            dispatched.join(", ")
        ));
    }
    match &view.active {
        Some(active) if !dispatched.contains(&active.task_id.as_str()) => errors.push(format!(
            "active marker names '{}' which is not dispatched",
            active.task_id
        )),
        None if !dispatched.is_empty() => errors.push(format!(
            "task '{}' is dispatched without an active marker",
            dispatched[0]
        )),
        _ => {}
    }

    for (id, state) in &view.tasks {
        if view.plan.task(id).is_none() {
            errors.push(format!("task '{id}' is missing from the plan"));
        }
        let results: Vec<_> = view.results_for(id).collect();
        let recorded = u32::try_from(results.len()).unwrap_or(u32::MAX);
        let in_flight = u32::from(state.status == TaskStatus::Dispatched);
        if recorded + in_flight != state.attempts {
            errors.push(format!(
                "task '{id}' has {} attempts but {recorded} results",
                state.attempts
            ));
        }
        let expected = match state.status {
            TaskStatus::Succeeded => Some(Outcome::Success),
            TaskStatus::Failed => Some(Outcome::Failed),
            TaskStatus::Blocked => Some(Outcome::Blocked),
            TaskStatus::Pending | TaskStatus::Dispatched => None,
        };
        if let Some(outcome) = expected {
            let last = results.last();
            let last_key = last.map(|result| (result.outcome, result.attempt));
            if last_key != Some((outcome, state.attempts)) {
                errors.push(format!(
                    "task '{id}' is {:?} without a matching result for attempt {}",
                    state.status, state.attempts
                ));
            }
        }
    }

    for objective in &view.plan.objectives {
        if objective.sources.is_empty() {
            errors.push(format!("objective '{}' has no document sources", objective.id));
        }
    }

    errors
}
