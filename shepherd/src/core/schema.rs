//! Embedded JSON Schemas for collaborator payloads.

use anyhow::{Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

const EXECUTOR_RESULT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/executor_result.schema.json"
));
const PLAN_SCHEMA: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/schemas/plan.schema.json"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    ExecutorResult,
    Plan,
}

impl SchemaKind {
    fn source(self) -> &'static str {
        match self {
            Self::ExecutorResult => EXECUTOR_RESULT_SCHEMA,
            Self::Plan => PLAN_SCHEMA,
        }
    }
}

/// Validate `value` against an embedded schema.
///
/// Returns every violation message, empty on success. Errors only if the
/// embedded schema itself cannot be compiled.
pub fn schema_errors(kind: SchemaKind, value: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(kind.source())
        .map_err(|err| anyhow!("parse embedded {kind:?} schema: {err}"))?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    Ok(compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn embedded_schemas_compile() {
        assert!(
            !schema_errors(SchemaKind::ExecutorResult, &json!({}))
                .expect("compile")
                .is_empty()
        );
        assert!(
            !schema_errors(SchemaKind::Plan, &json!({}))
                .expect("compile")
                .is_empty()
        );
    }

    #[test]
    fn executor_result_rejects_unknown_status() {
        let value = json!({
            "status": "partial",
            "files_changed": [],
            "tests_run": [],
            "notes": ""
        });
        let errors = schema_errors(SchemaKind::ExecutorResult, &value).expect("compile");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("partial"));
    }

    #[test]
    fn plan_accepts_minimal_document() {
        let value = json!({
            "version": 1,
            "objectives": [{"id": "o1", "description": "d", "sources": ["design/api.md"]}],
            "tasks": [{"id": "t1", "objective": "o1", "description": "do it"}]
        });
        assert!(schema_errors(SchemaKind::Plan, &value).expect("compile").is_empty());
    }
}
