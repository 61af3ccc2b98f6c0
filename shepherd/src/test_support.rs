//! Test-only helpers: deterministic plans, results, a project workspace, and
//! scripted collaborators that never spawn processes.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::authority::{AuthoritativeDocument, AuthoritySet, content_hash};
use crate::core::ledger::{LedgerEntry, LedgerEvent};
use crate::core::plan::{Objective, PLAN_VERSION, PlanState, TaskSpec};
use crate::core::types::{DocumentRole, FailureReason, Outcome, ResultPayload, TaskResult};
use crate::io::clock::Clock;
use crate::io::config::{PathsConfig, ShepherdConfig, load_config, write_config};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::init::{InitOptions, init_project};
use crate::io::paths::ShepherdPaths;
use crate::io::planner::{PlanRequest, Planner, PlannerResponse};

pub const TEST_TIMESTAMP: &str = "2026-01-01T00:00:00Z";

/// Create an objective traced to `sources`.
pub fn objective(id: &str, sources: &[&str]) -> Objective {
    Objective {
        id: id.to_string(),
        description: format!("{id} holds"),
        sources: sources.iter().map(|source| source.to_string()).collect(),
    }
}

/// Create a task with no dependencies.
pub fn task(id: &str, objective_id: &str) -> TaskSpec {
    TaskSpec {
        id: id.to_string(),
        objective: objective_id.to_string(),
        description: format!("do {id}"),
        depends_on: Vec::new(),
        decomposed_from: None,
        scope: Vec::new(),
        success_criteria: Vec::new(),
    }
}

/// One objective `o1` (traced to `docs/goals.md`) with `ids` as its tasks, in order.
pub fn plan_with_tasks(ids: &[&str]) -> PlanState {
    PlanState {
        version: PLAN_VERSION,
        objectives: vec![objective("o1", &["docs/goals.md"])],
        tasks: ids.iter().map(|id| task(id, "o1")).collect(),
    }
}

pub fn entry(seq: u64, event: LedgerEvent) -> LedgerEntry {
    LedgerEntry {
        seq,
        at: TEST_TIMESTAMP.to_string(),
        event,
    }
}

pub fn success_result(task_id: &str, attempt: u32) -> TaskResult {
    TaskResult {
        task_id: task_id.to_string(),
        attempt,
        outcome: Outcome::Success,
        reason: None,
        payload: ResultPayload::default(),
        recorded_at: TEST_TIMESTAMP.to_string(),
    }
}

pub fn failed_result(task_id: &str, attempt: u32, reason: FailureReason) -> TaskResult {
    TaskResult {
        outcome: Outcome::Failed,
        reason: Some(reason),
        ..success_result(task_id, attempt)
    }
}

/// Authority set whose document hashes are derived from their paths.
pub fn authority_set(docs: &[(&str, DocumentRole)]) -> AuthoritySet {
    AuthoritySet::new(
        docs.iter().map(|(path, role)| AuthoritativeDocument {
            path: path.to_string(),
            role: *role,
            hash: content_hash(path.as_bytes()),
            validated_at: TEST_TIMESTAMP.to_string(),
        }),
        BTreeMap::new(),
    )
}

/// Executor reply object with the given status and no changes.
pub fn reply(status: &str) -> Value {
    json!({
        "status": status,
        "files_changed": [],
        "tests_run": [],
        "notes": format!("{status} by script"),
    })
}

/// Clock frozen at [`TEST_TIMESTAMP`].
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Default for FixedClock {
    fn default() -> Self {
        Self(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A scaffolded project in a temporary directory (`shepherd init` layout).
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        init_project(dir.path(), &InitOptions::default()).expect("init project");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> ShepherdPaths {
        ShepherdPaths::new(self.root(), &PathsConfig::default())
    }

    /// Write a project-relative file, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.root().join(rel)).expect("read file")
    }

    /// Replace the source manifest with `(path, role)` entries.
    pub fn write_sources(&self, sources: &[(&str, &str)]) {
        let sources: Vec<Value> = sources
            .iter()
            .map(|(path, role)| json!({"path": path, "role": role}))
            .collect();
        let raw = serde_json::to_string_pretty(&json!({ "sources": sources })).expect("serialize");
        self.write("ai/SOURCES.yaml", &raw);
    }

    /// Edit `ai/config.json` in place.
    pub fn configure(&self, edit: impl FnOnce(&mut ShepherdConfig)) {
        let path = ShepherdPaths::bootstrap_config(self.root());
        let mut config = load_config(&path).expect("load config");
        edit(&mut config);
        write_config(&path, &config).expect("write config");
    }

    /// Write `docs/goals.md` and list it as the primary source, so that
    /// [`plan_with_tasks`] plans are traceable.
    pub fn with_goal_document(self) -> Self {
        self.write("docs/goals.md", "# Goals\n\nShip it.\n");
        self.write_sources(&[("docs/goals.md", "primary")]);
        self
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Executor that answers from a queue and records every request.
///
/// An exhausted script answers with an executor error.
#[derive(Default)]
pub struct ScriptedExecutor {
    replies: RefCell<VecDeque<Result<Value>>>,
    calls: RefCell<Vec<(String, u32)>>,
}

impl ScriptedExecutor {
    pub fn new(replies: impl IntoIterator<Item = Result<Value>>) -> Self {
        Self {
            replies: RefCell::new(replies.into_iter().collect()),
            calls: RefCell::default(),
        }
    }

    /// `(task_id, attempt)` for every invocation, in order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.borrow().clone()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, request: &ExecRequest<'_>) -> Result<Value> {
        self.calls
            .borrow_mut()
            .push((request.task.id.clone(), request.attempt));
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("scripted executor has no reply left")))
    }
}

/// Planner that answers from a queue, then reports no change.
#[derive(Default)]
pub struct ScriptedPlanner {
    responses: RefCell<VecDeque<Result<PlannerResponse>>>,
    requests: RefCell<u32>,
}

impl ScriptedPlanner {
    pub fn new(responses: impl IntoIterator<Item = Result<PlannerResponse>>) -> Self {
        Self {
            responses: RefCell::new(responses.into_iter().collect()),
            requests: RefCell::default(),
        }
    }

    /// Planner that proposes `plan` once.
    pub fn proposing(plan: &PlanState) -> Self {
        Self::new([Ok(PlannerResponse::Plan {
            plan: serde_json::to_value(plan).expect("serialize plan"),
        })])
    }

    pub fn requests(&self) -> u32 {
        *self.requests.borrow()
    }
}

impl Planner for ScriptedPlanner {
    fn request_plan(&self, _request: &PlanRequest<'_>) -> Result<PlannerResponse> {
        *self.requests.borrow_mut() += 1;
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or(Ok(PlannerResponse::Unchanged))
    }
}
