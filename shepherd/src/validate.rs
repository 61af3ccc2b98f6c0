//! `shepherd validate`: load everything `start` would load, dispatch nothing.

use std::path::Path;

use anyhow::Result;

use crate::core::authority::untraceable_objectives;
use crate::core::invariants::check_invariants;
use crate::errors::{ShepherdError, classify};
use crate::io::authority::{check_tampering, load_authority};
use crate::io::clock::Clock;
use crate::io::state_store::StateStore;
use crate::start::Session;

/// Findings that would stop or refuse a run. Empty means `start` would proceed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub documents: usize,
    pub findings: Vec<String>,
}

impl ValidateOutcome {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Load config, authority store, and state store; report what a start would trip over.
///
/// Unreadable config, authority files, or state are returned as errors.
pub fn validate_project(root: &Path, clock: &dyn Clock) -> Result<ValidateOutcome> {
    let session = Session::open(root)?;
    let store = StateStore::open(&session.paths)?;
    let authority = load_authority(&session.paths, clock)?;

    let mut findings = Vec::new();
    if let Some(stop) = store.open_stop() {
        findings.push(format!(
            "stop #{} ({}) is open: {}",
            stop.seq, stop.trigger, stop.reason
        ));
    }
    if let Some(baseline) = store.baseline_hashes()
        && let Err(err) = check_tampering(baseline, &authority)
    {
        match classify(&err) {
            Some(ShepherdError::Tampered { files }) => {
                findings.push(format!("immutable files changed: {}", files.join(", ")));
            }
            _ => findings.push(format!("{err:#}")),
        }
    }
    for objective in untraceable_objectives(&store.view().plan, &authority) {
        findings.push(format!("untraceable objective: {objective}"));
    }
    findings.extend(
        check_invariants(store.view())
            .into_iter()
            .map(|violation| format!("invariant violated: {violation}")),
    );

    Ok(ValidateOutcome {
        documents: authority.documents().count(),
        findings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StopTrigger;
    use crate::test_support::{FixedClock, Workspace, plan_with_tasks};

    #[test]
    fn fresh_project_is_clean() {
        let ws = Workspace::new().with_goal_document();
        let outcome = validate_project(ws.root(), &FixedClock::default()).expect("validate");
        assert!(outcome.is_clean(), "{:?}", outcome.findings);
        assert_eq!(outcome.documents, 1);
    }

    #[test]
    fn reports_open_stop_and_untraceable_plan() {
        let ws = Workspace::new().with_goal_document();
        let clock = FixedClock::default();
        let mut store = StateStore::open(&ws.paths()).expect("open");
        store
            .accept_plan(plan_with_tasks(&["t1"]), &clock)
            .expect("plan");
        store
            .record_stop(StopTrigger::ExecutorBlocked, "needs a key", &clock)
            .expect("stop");
        ws.write_sources(&[]);

        let outcome = validate_project(ws.root(), &clock).expect("validate");
        assert_eq!(outcome.findings.len(), 2, "{:?}", outcome.findings);
        assert!(outcome.findings[0].contains("executor-blocked"));
        assert!(outcome.findings[1].starts_with("untraceable objective: objective 'o1'"));
    }

    #[test]
    fn invalid_config_is_an_error() {
        let ws = Workspace::new();
        ws.write("ai/config.json", "{\"mcp\": {}}");
        let err = validate_project(ws.root(), &FixedClock::default()).unwrap_err();
        assert!(matches!(classify(&err), Some(ShepherdError::Authority(_))));
    }
}
