//! Executor adapter.
//!
//! The [`Executor`] trait decouples the dispatch loop from the worker backend.
//! [`McpExecutor`] spawns the configured command once per task (fresh session
//! per call); tests use scripted executors that never spawn processes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::plan::TaskSpec;
use crate::core::strict_json::parse_strict;
use crate::errors::ShepherdError;
use crate::io::process::{command_from_argv, run_bounded};

/// One task invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub task: &'a TaskSpec,
    pub attempt: u32,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    task: WireTask<'a>,
}

#[derive(Serialize)]
struct WireTask<'a> {
    #[serde(flatten)]
    spec: &'a TaskSpec,
    attempt: u32,
    timeout_seconds: u64,
}

impl ExecRequest<'_> {
    /// The single JSON line written to the executor's stdin.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(&WireRequest {
            task: WireTask {
                spec: self.task,
                attempt: self.attempt,
                timeout_seconds: self.timeout.as_secs(),
            },
        })
        .context("serialize executor request")?;
        line.push('\n');
        Ok(line)
    }
}

/// Abstraction over executor backends.
pub trait Executor {
    /// Run one task and return the raw reply object.
    ///
    /// Errors carry policy meaning: [`ShepherdError::Timeout`] when the
    /// deadline passed, [`ShepherdError::Schema`] when the reply is not a
    /// strict JSON object, anything else when the worker could not be run.
    fn execute(&self, request: &ExecRequest<'_>) -> Result<Value>;
}

/// Executor that spawns the configured `mcp.command`.
pub struct McpExecutor {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub output_limit_bytes: usize,
}

impl Executor for McpExecutor {
    #[instrument(skip_all, fields(task_id = %request.task.id, attempt = request.attempt))]
    fn execute(&self, request: &ExecRequest<'_>) -> Result<Value> {
        info!(command = ?self.argv, "invoking executor");
        let mut cmd = command_from_argv(&self.argv)?;
        cmd.current_dir(&self.workdir);
        let output = run_bounded(
            cmd,
            request.to_line()?.as_bytes(),
            request.timeout,
            self.output_limit_bytes,
        )
        .context("run executor")?;

        if output.timed_out {
            return Err(ShepherdError::Timeout {
                seconds: request.timeout.as_secs(),
            }
            .into());
        }
        let stderr = output.stderr_text();
        if !stderr.is_empty() {
            warn!(stderr = %stderr, "executor stderr");
        }
        let line = output.first_line().ok_or_else(|| {
            anyhow!(
                "executor exited ({}) without a reply: {stderr}",
                output.exit_label()
            )
        })?;
        if output.status.is_some_and(|status| !status.success()) {
            warn!(exit = %output.exit_label(), "executor replied but exited unsuccessfully");
        }
        let value = parse_reply(&line)?;
        debug!("executor reply parsed");
        Ok(value)
    }
}

/// Strict-parse one reply line into a JSON object.
pub fn parse_reply(line: &str) -> Result<Value> {
    let value = parse_strict(line)
        .map_err(|err| ShepherdError::Schema(format!("reply is not strict JSON: {err}")))?;
    if !value.is_object() {
        return Err(ShepherdError::Schema("reply must be a JSON object".to_string()).into());
    }
    Ok(value)
}
