//! Shared deterministic types for the control loop.
//!
//! These types define stable contracts between core components and the
//! persisted ledger. They must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Binding strength of a document listed in the source manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentRole {
    Primary,
    Authoritative,
    Constraints,
    Optional,
}

impl DocumentRole {
    /// Optional documents never make an objective traceable.
    pub fn is_binding(self) -> bool {
        !matches!(self, Self::Optional)
    }
}

/// Lifecycle status of a task, derived by replaying the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    Blocked,
}

/// Derived objective status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveStatus {
    Pending,
    Satisfied,
    Blocked,
}

/// Outcome declared by the executor (or imposed by the daemon on failure paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
    Blocked,
}

/// Why an attempt was recorded as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// The executor itself reported `failed`.
    Executor,
    /// The executor did not answer within `task_timeout_seconds`.
    Timeout,
    /// The executor answered with a payload that failed validation.
    Schema,
    /// The executor reported changes to forbidden paths.
    ForbiddenPath,
    /// The executor process could not be run or exited without a reply.
    ExecutorError,
    /// A previous daemon crashed while the attempt was in flight.
    CrashRecovery,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executor => "executor",
            Self::Timeout => "timeout",
            Self::Schema => "schema",
            Self::ForbiddenPath => "forbidden-path",
            Self::ExecutorError => "executor-error",
            Self::CrashRecovery => "crash-recovery",
        }
    }
}

/// Structured payload carried by a task result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub files_changed: Vec<String>,
    pub tests_run: Vec<String>,
    pub notes: String,
}

/// Immutable record of one attempt. Identity is `(task_id, attempt)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub attempt: u32,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub payload: ResultPayload,
    pub recorded_at: String,
}

/// Marker for the single in-flight dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: String,
    pub attempt: u32,
    pub dispatched_at: String,
}

/// Stable names for every condition that halts the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopTrigger {
    PlannerConflict,
    ClarificationRequired,
    UntraceableObjective,
    PlanInvalid,
    PlannerUnavailable,
    ExecutorBlocked,
    RetryBoundExceeded,
    TaskTimeout,
    ConsecutiveFailures,
    ForbiddenPath,
    InvariantViolated,
    StateCorrupt,
    AuthorityInvalid,
    AuthorityTampered,
    AuthorityModified,
}

impl StopTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlannerConflict => "planner-conflict",
            Self::ClarificationRequired => "clarification-required",
            Self::UntraceableObjective => "untraceable-objective",
            Self::PlanInvalid => "plan-invalid",
            Self::PlannerUnavailable => "planner-unavailable",
            Self::ExecutorBlocked => "executor-blocked",
            Self::RetryBoundExceeded => "retry-bound-exceeded",
            Self::TaskTimeout => "task-timeout",
            Self::ConsecutiveFailures => "consecutive-failures",
            Self::ForbiddenPath => "forbidden-path",
            Self::InvariantViolated => "invariant-violated",
            Self::StateCorrupt => "state-corrupt",
            Self::AuthorityInvalid => "authority-invalid",
            Self::AuthorityTampered => "authority-tampered",
            Self::AuthorityModified => "authority-modified",
        }
    }
}

impl fmt::Display for StopTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State captured at the moment a stop was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<TaskResult>,
    pub task_counts: crate::core::progress::TaskCounts,
}

/// Terminal record. Once written, the loop refuses further dispatch until an
/// operator clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRecord {
    /// Monotonic stop sequence number (1-indexed).
    pub seq: u64,
    pub trigger: StopTrigger,
    pub reason: String,
    pub snapshot: StopSnapshot,
    pub recorded_at: String,
}
