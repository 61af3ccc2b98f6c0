//! Planner adapter.
//!
//! The planner is consulted only between dispatches. It answers with a full
//! replacement plan or with one of the non-plan signals. Two backends exist:
//! an inbox file written by an operator or an external agent, and an optional
//! command spawned per request.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::authority::AuthoritativeDocument;
use crate::core::plan::PlanState;
use crate::core::progress::ProgressState;
use crate::core::schema::{SchemaKind, schema_errors};
use crate::core::strict_json::from_strict_str;
use crate::core::types::{StopRecord, TaskResult};
use crate::errors::ShepherdError;
use crate::io::process::{command_from_argv, run_bounded};

/// Everything the planner may read. It never sees the ledger itself.
#[derive(Debug, Serialize)]
pub struct PlanRequest<'a> {
    pub documents: Vec<&'a AuthoritativeDocument>,
    pub plan: &'a PlanState,
    pub progress: &'a ProgressState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<&'a TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stop: Option<&'a StopRecord>,
}

/// Planner reply. `plan` stays raw JSON until it passes the plan schema.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannerResponse {
    Plan { plan: Value },
    Conflict { detail: String },
    Ambiguous { detail: String },
    Unchanged,
}

pub trait Planner {
    /// Errors mean the planner could not answer; a [`ShepherdError::Schema`]
    /// error means it answered with something unusable.
    fn request_plan(&self, request: &PlanRequest<'_>) -> Result<PlannerResponse>;
}

/// Strict-parse a response document.
pub fn parse_response(raw: &str) -> Result<PlannerResponse> {
    from_strict_str(raw)
        .map_err(|err| ShepherdError::Schema(format!("planner response: {err}")).into())
}

/// Validate a proposed plan against the plan schema and decode it.
///
/// Returns every schema violation on failure.
pub fn plan_from_value(value: Value) -> Result<PlanState, Vec<String>> {
    let errors = schema_errors(SchemaKind::Plan, &value).map_err(|err| vec![err.to_string()])?;
    if !errors.is_empty() {
        return Err(errors);
    }
    serde_json::from_value(value).map_err(|err| vec![err.to_string()])
}

/// Reads and consumes `PLAN_PROPOSAL.json`. No file means no change.
pub struct InboxPlanner {
    pub path: PathBuf,
}

impl Planner for InboxPlanner {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn request_plan(&self, _request: &PlanRequest<'_>) -> Result<PlannerResponse> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no plan proposal waiting");
                return Ok(PlannerResponse::Unchanged);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        fs::remove_file(&self.path)
            .with_context(|| format!("consume {}", self.path.display()))?;
        info!("consumed plan proposal");
        parse_response(&raw)
    }
}

/// Spawns `planner.command` with the request on stdin, one response line on stdout.
pub struct CommandPlanner {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Planner for CommandPlanner {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn request_plan(&self, request: &PlanRequest<'_>) -> Result<PlannerResponse> {
        let mut line = serde_json::to_string(request).context("serialize plan request")?;
        line.push('\n');
        let mut cmd = command_from_argv(&self.argv)?;
        cmd.current_dir(&self.workdir);
        let output = run_bounded(cmd, line.as_bytes(), self.timeout, self.output_limit_bytes)
            .context("run planner")?;
        if output.timed_out {
            return Err(ShepherdError::Timeout {
                seconds: self.timeout.as_secs(),
            })
            .context("planner did not answer");
        }
        let stderr = output.stderr_text();
        if !stderr.is_empty() {
            warn!(stderr = %stderr, "planner stderr");
        }
        if output.status.is_some_and(|status| !status.success()) {
            return Err(anyhow!("planner failed ({}): {stderr}", output.exit_label()));
        }
        let reply = output
            .first_line()
            .ok_or_else(|| anyhow!("planner exited without a response"))?;
        parse_response(&reply)
    }
}
