//! Deterministic task selection.

use crate::core::ledger::StateView;
use crate::core::plan::TaskSpec;
use crate::core::progress::objective_status;
use crate::core::types::{ObjectiveStatus, TaskStatus};

/// Tasks that may be dispatched next, in selection order.
///
/// Eligible: pending or failed (a retry), not superseded by decomposition,
/// every dependency done, and the parent objective still pending. Ordered by
/// creation (plan seq, plan position) then id.
pub fn eligible_tasks(view: &StateView) -> Vec<&TaskSpec> {
    let superseded = view.plan.superseded();
    let mut eligible: Vec<&TaskSpec> = view
        .plan
        .tasks
        .iter()
        .filter(|task| !superseded.contains(task.id.as_str()))
        .filter(|task| {
            matches!(
                view.status_of(&task.id),
                Some(TaskStatus::Pending | TaskStatus::Failed)
            )
        })
        .filter(|task| task.depends_on.iter().all(|dep| view.is_done(dep)))
        .filter(|task| objective_status(view, &task.objective) == ObjectiveStatus::Pending)
        .collect();
    eligible.sort_by(|a, b| {
        let key_a = view.tasks.get(&a.id).map(|state| state.created_key());
        let key_b = view.tasks.get(&b.id).map(|state| state.created_key());
        key_a.cmp(&key_b).then_with(|| a.id.cmp(&b.id))
    });
    eligible
}

pub fn select_next_task(view: &StateView) -> Option<&TaskSpec> {
    eligible_tasks(view).into_iter().next()
}
