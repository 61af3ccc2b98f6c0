//! Plan acceptance review.
//!
//! A proposed plan replaces the current one wholesale, so every structural
//! rule is re-checked against the full proposal and the recorded history.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::authority::{AuthoritySet, untraceable_objectives};
use crate::core::ledger::StateView;
use crate::core::plan::{PLAN_VERSION, PlanState};
use crate::core::types::{Outcome, StopTrigger};

/// Findings for one proposed plan. Empty means accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanReview {
    pub untraceable: Vec<String>,
    pub invalid: Vec<String>,
}

impl PlanReview {
    pub fn is_accepted(&self) -> bool {
        self.untraceable.is_empty() && self.invalid.is_empty()
    }

    /// Stop trigger and reason for a rejected plan.
    pub fn rejection(&self) -> Option<(StopTrigger, String)> {
        if !self.untraceable.is_empty() {
            return Some((StopTrigger::UntraceableObjective, self.untraceable.join("; ")));
        }
        if !self.invalid.is_empty() {
            return Some((StopTrigger::PlanInvalid, self.invalid.join("; ")));
        }
        None
    }
}

pub fn review_plan(view: &StateView, proposed: &PlanState, authority: &AuthoritySet) -> PlanReview {
    PlanReview {
        untraceable: untraceable_objectives(proposed, authority),
        invalid: structural_errors(view, proposed),
    }
}

fn structural_errors(view: &StateView, proposed: &PlanState) -> Vec<String> {
    let mut errors = Vec::new();

    if proposed.version != PLAN_VERSION {
        errors.push(format!(
            "unsupported plan version {} (expected {PLAN_VERSION})",
            proposed.version
        ));
    }

    let mut objective_ids = BTreeSet::new();
    for objective in &proposed.objectives {
        if !objective_ids.insert(objective.id.as_str()) {
            errors.push(format!("duplicate objective id '{}'", objective.id));
        }
    }
    let mut task_ids = BTreeSet::new();
    for task in &proposed.tasks {
        if !task_ids.insert(task.id.as_str()) {
            errors.push(format!("duplicate task id '{}'", task.id));
        }
    }

    for task in &proposed.tasks {
        if !objective_ids.contains(task.objective.as_str()) {
            errors.push(format!(
                "task '{}' references unknown objective '{}'",
                task.id, task.objective
            ));
        }
        for dep in &task.depends_on {
            if dep == &task.id {
                errors.push(format!("task '{}' depends on itself", task.id));
            } else if !task_ids.contains(dep.as_str()) {
                errors.push(format!("task '{}' depends on unknown task '{dep}'", task.id));
            }
        }
        if let Some(parent) = &task.decomposed_from {
            if parent == &task.id || !task_ids.contains(parent.as_str()) {
                errors.push(format!(
                    "task '{}' is decomposed from unknown task '{parent}'",
                    task.id
                ));
            } else if !view
                .results_for(parent)
                .any(|result| result.outcome == Outcome::Failed)
            {
                errors.push(format!(
                    "task '{parent}' decomposed before recording a failed result"
                ));
            }
        }
    }

    if let Some(task_id) = find_cycle(proposed) {
        errors.push(format!("dependency cycle through task '{task_id}'"));
    }

    for (id, state) in &view.tasks {
        if !state.has_history() {
            continue;
        }
        match proposed.task(id) {
            None => errors.push(format!("task '{id}' has history and cannot be removed")),
            Some(spec) if view.plan.task(id) != Some(spec) => {
                errors.push(format!("task '{id}' has history and cannot be redefined"));
            }
            Some(_) => {}
        }
    }

    errors
}

/// Completion graph: a task waits on its dependencies, and a decomposed
/// parent waits on its children. Any cycle can never complete.
fn find_cycle(plan: &PlanState) -> Option<String> {
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for task in &plan.tasks {
        let out = edges.entry(task.id.as_str()).or_default();
        out.extend(task.depends_on.iter().map(String::as_str));
        if let Some(parent) = task.decomposed_from.as_deref() {
            edges.entry(parent).or_default().push(task.id.as_str());
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        edges: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut BTreeMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(node),
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        for &next in edges.get(node).into_iter().flatten() {
            if let Some(found) = visit(next, edges, marks) {
                return Some(found);
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for &node in edges.keys() {
        if let Some(found) = visit(node, &edges, &mut marks) {
            return Some(found.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::{LedgerEvent, replay};
    use crate::core::types::{DocumentRole, FailureReason};
    use crate::test_support::{
        authority_set, entry, failed_result, objective, plan_with_tasks, task,
    };

    fn docs() -> AuthoritySet {
        authority_set(&[("docs/goals.md", DocumentRole::Primary)])
    }

    #[test]
    fn accepts_well_formed_plan() {
        let review = review_plan(&StateView::default(), &plan_with_tasks(&["t1", "t2"]), &docs());
        assert!(review.is_accepted());
        assert_eq!(review.rejection(), None);
    }

    #[test]
    fn untraceable_objective_wins_over_structure() {
        let mut plan = plan_with_tasks(&["t1"]);
        plan.objectives.push(objective("o2", &["docs/unlisted.md"]));
        plan.tasks.push(task("t1", "o1"));
        let review = review_plan(&StateView::default(), &plan, &docs());
        let (trigger, reason) = review.rejection().expect("rejected");
        assert_eq!(trigger, StopTrigger::UntraceableObjective);
        assert!(reason.contains("o2"));
        assert_eq!(review.invalid, vec!["duplicate task id 't1'".to_string()]);
    }

    #[test]
    fn rejects_unknown_references_and_cycles() {
        let mut plan = plan_with_tasks(&["t1", "t2"]);
        plan.tasks[0].depends_on = vec!["t2".to_string()];
        plan.tasks[1].depends_on = vec!["t1".to_string(), "t9".to_string()];
        plan.tasks.push(task("t3", "o9"));
        let review = review_plan(&StateView::default(), &plan, &docs());
        assert_eq!(
            review.invalid,
            vec![
                "task 't2' depends on unknown task 't9'".to_string(),
                "task 't3' references unknown objective 'o9'".to_string(),
                "dependency cycle through task 't1'".to_string(),
            ]
        );
    }

    #[test]
    fn decomposition_requires_failed_result() {
        let mut plan = plan_with_tasks(&["t1"]);
        let mut child = task("t1a", "o1");
        child.decomposed_from = Some("t1".to_string());
        plan.tasks.push(child);

        let review = review_plan(&StateView::default(), &plan, &docs());
        assert_eq!(
            review.invalid,
            vec!["task 't1' decomposed before recording a failed result".to_string()]
        );

        let view = replay(&[
            entry(
                1,
                LedgerEvent::PlanAccepted {
                    plan: plan_with_tasks(&["t1"]),
                },
            ),
            entry(
                2,
                LedgerEvent::Dispatched {
                    task_id: "t1".to_string(),
                    attempt: 1,
                },
            ),
            entry(
                3,
                LedgerEvent::ResultRecorded {
                    result: failed_result("t1", 1, FailureReason::Executor),
                },
            ),
        ])
        .expect("replay");
        assert!(review_plan(&view, &plan, &docs()).is_accepted());
    }

    /// A child that depends on its own decomposed parent could never run.
    #[test]
    fn child_depending_on_parent_is_a_cycle() {
        let mut plan = plan_with_tasks(&["t1"]);
        let mut child = task("t1a", "o1");
        child.decomposed_from = Some("t1".to_string());
        child.depends_on = vec!["t1".to_string()];
        plan.tasks.push(child);
        assert!(
            structural_errors(&StateView::default(), &plan)
                .iter()
                .any(|err| err.starts_with("dependency cycle"))
        );
    }

    #[test]
    fn tasks_with_history_are_frozen() {
        let view = replay(&[
            entry(
                1,
                LedgerEvent::PlanAccepted {
                    plan: plan_with_tasks(&["t1", "t2"]),
                },
            ),
            entry(
                2,
                LedgerEvent::Dispatched {
                    task_id: "t1".to_string(),
                    attempt: 1,
                },
            ),
            entry(
                3,
                LedgerEvent::ResultRecorded {
                    result: failed_result("t1", 1, FailureReason::Executor),
                },
            ),
        ])
        .expect("replay");

        let mut redefined = plan_with_tasks(&["t1", "t2"]);
        redefined.tasks[0].description = "something else".to_string();
        assert_eq!(
            review_plan(&view, &redefined, &docs()).invalid,
            vec!["task 't1' has history and cannot be redefined".to_string()]
        );

        let removed = plan_with_tasks(&["t2"]);
        assert_eq!(
            review_plan(&view, &removed, &docs()).invalid,
            vec!["task 't1' has history and cannot be removed".to_string()]
        );

        let mut pending_edit = plan_with_tasks(&["t1", "t2"]);
        pending_edit.tasks[1].description = "t2 may still change".to_string();
        assert!(review_plan(&view, &pending_edit, &docs()).is_accepted());
    }
}
