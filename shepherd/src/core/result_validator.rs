//! Executor result validation.
//!
//! Turns a raw executor reply into a [`TaskResult`] or a [`Rejection`].
//! Schema and forbidden-path rejections still become failed attempts; a stale
//! reply never touches state.

use serde::Deserialize;
use serde_json::Value;

use crate::core::forbidden::ForbiddenPaths;
use crate::core::ledger::StateView;
use crate::core::schema::{SchemaKind, schema_errors};
use crate::core::types::{FailureReason, Outcome, ResultPayload, TaskResult};

const REPLY_KEYS: [&str; 4] = ["status", "files_changed", "tests_run", "notes"];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecutorReply {
    status: Outcome,
    files_changed: Vec<String>,
    tests_run: Vec<String>,
    notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The reply did not conform to the result schema.
    Schema(Vec<String>),
    /// The reply reported changes to forbidden paths.
    ForbiddenPaths {
        paths: Vec<String>,
        payload: ResultPayload,
    },
    /// The reply names a task or attempt that is not in flight.
    Stale { task_id: String, attempt: u32 },
}

impl Rejection {
    /// The failed attempt recorded in place of a rejected reply. `None` for
    /// stale replies, which are dropped.
    pub fn into_failed_result(
        self,
        task_id: &str,
        attempt: u32,
        recorded_at: &str,
    ) -> Option<TaskResult> {
        let (reason, payload) = match self {
            Self::Stale { .. } => return None,
            Self::Schema(errors) => (
                FailureReason::Schema,
                ResultPayload {
                    notes: format!("result rejected: {}", errors.join("; ")),
                    ..ResultPayload::default()
                },
            ),
            Self::ForbiddenPaths { paths, mut payload } => {
                payload.notes = format!("forbidden paths modified: {}", paths.join(", "));
                (FailureReason::ForbiddenPath, payload)
            }
        };
        Some(TaskResult {
            task_id: task_id.to_string(),
            attempt,
            outcome: Outcome::Failed,
            reason: Some(reason),
            payload,
            recorded_at: recorded_at.to_string(),
        })
    }
}

pub struct ResultValidator<'a> {
    pub forbidden: &'a ForbiddenPaths,
    /// When false, unknown top-level keys are dropped instead of rejected.
    pub strict: bool,
}

impl ResultValidator<'_> {
    pub fn validate(
        &self,
        view: &StateView,
        task_id: &str,
        attempt: u32,
        raw: &Value,
        recorded_at: &str,
    ) -> Result<TaskResult, Rejection> {
        let in_flight = view
            .active
            .as_ref()
            .is_some_and(|active| active.task_id == task_id && active.attempt == attempt);
        if !in_flight {
            return Err(Rejection::Stale {
                task_id: task_id.to_string(),
                attempt,
            });
        }

        let value = if self.strict {
            raw.clone()
        } else {
            strip_unknown_keys(raw)
        };
        let errors = schema_errors(SchemaKind::ExecutorResult, &value)
            .map_err(|err| Rejection::Schema(vec![err.to_string()]))?;
        if !errors.is_empty() {
            return Err(Rejection::Schema(errors));
        }
        let reply: ExecutorReply =
            serde_json::from_value(value).map_err(|err| Rejection::Schema(vec![err.to_string()]))?;

        let payload = ResultPayload {
            files_changed: reply.files_changed,
            tests_run: reply.tests_run,
            notes: reply.notes,
        };
        let violations: Vec<String> = self
            .forbidden
            .violations(&payload.files_changed)
            .into_iter()
            .map(str::to_string)
            .collect();
        if !violations.is_empty() {
            return Err(Rejection::ForbiddenPaths {
                paths: violations,
                payload,
            });
        }

        Ok(TaskResult {
            task_id: task_id.to_string(),
            attempt,
            outcome: reply.status,
            reason: (reply.status == Outcome::Failed).then_some(FailureReason::Executor),
            payload,
            recorded_at: recorded_at.to_string(),
        })
    }
}

fn strip_unknown_keys(raw: &Value) -> Value {
    match raw {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| REPLY_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
