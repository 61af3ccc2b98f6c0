//! Plan snapshot supplied by the planner.
//!
//! A plan carries structure only (objectives, tasks, dependency edges). Task
//! and objective statuses are never stored here; they are derived from the
//! ledger so that a planner cannot forge progress.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const PLAN_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanState {
    pub version: u32,
    pub objectives: Vec<Objective>,
    pub tasks: Vec<TaskSpec>,
}

impl Default for PlanState {
    fn default() -> Self {
        Self {
            version: PLAN_VERSION,
            objectives: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

/// A verifiable condition derived from one or more authoritative documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Objective {
    pub id: String,
    pub description: String,
    /// Derivation trace: manifest paths this objective was derived from.
    pub sources: Vec<String>,
}

/// A dispatchable unit of work for one objective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub id: String,
    pub objective: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Set when this task was produced by decomposing a failed task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposed_from: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<String>,
}

impl PlanState {
    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn objective(&self, id: &str) -> Option<&Objective> {
        self.objectives.iter().find(|objective| objective.id == id)
    }

    /// Ids of tasks that were decomposed into children. They are never
    /// selected again; their children carry the work.
    pub fn superseded(&self) -> BTreeSet<&str> {
        self.tasks
            .iter()
            .filter_map(|task| task.decomposed_from.as_deref())
            .collect()
    }

    /// Children produced by decomposing `parent_id`, in plan order.
    pub fn children_of<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a TaskSpec> {
        self.tasks
            .iter()
            .filter(move |task| task.decomposed_from.as_deref() == Some(parent_id))
    }

    /// Tasks grouped by objective id, in plan order.
    pub fn tasks_by_objective(&self) -> BTreeMap<&str, Vec<&TaskSpec>> {
        let mut grouped: BTreeMap<&str, Vec<&TaskSpec>> = BTreeMap::new();
        for task in &self.tasks {
            grouped.entry(task.objective.as_str()).or_default().push(task);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{objective, task};

    #[test]
    fn superseded_lists_decomposed_parents() {
        let mut child = task("t1a", "o1");
        child.decomposed_from = Some("t1".to_string());
        let plan = PlanState {
            version: PLAN_VERSION,
            objectives: vec![objective("o1", &["docs/api.md"])],
            tasks: vec![task("t1", "o1"), child, task("t2", "o1")],
        };

        let superseded = plan.superseded();
        assert_eq!(superseded.into_iter().collect::<Vec<_>>(), vec!["t1"]);
        let children: Vec<&str> = plan.children_of("t1").map(|t| t.id.as_str()).collect();
        assert_eq!(children, vec!["t1a"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{"version":1,"objectives":[],"tasks":[],"status":"done"}"#;
        let err = serde_json::from_str::<PlanState>(raw).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }
}
