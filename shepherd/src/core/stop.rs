//! Stop-condition evaluation.
//!
//! Pure predicates consulted at plan acceptance, before dispatch, and after a
//! result is applied. The first predicate that holds decides the trigger.

use std::collections::BTreeSet;

use crate::core::acceptance::PlanReview;
use crate::core::invariants::check_invariants;
use crate::core::ledger::StateView;
use crate::core::types::{FailureReason, Outcome, StopTrigger, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    PlanAcceptance,
    PreDispatch,
    PostResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_retries_per_task: u32,
    pub max_consecutive_failures: u32,
}

/// What the planner said instead of a usable plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerSignal {
    Conflict(String),
    Ambiguous(String),
    Unavailable(String),
}

/// External facts gathered by the loop for one evaluation.
#[derive(Debug, Default)]
pub struct Observations<'a> {
    pub planner: Option<&'a PlannerSignal>,
    pub plan_review: Option<&'a PlanReview>,
    pub forbidden_paths: &'a [String],
    pub authority_changes: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopDecision {
    Continue,
    Stop { trigger: StopTrigger, reason: String },
}

impl StopDecision {
    fn stop(trigger: StopTrigger, reason: impl Into<String>) -> Self {
        Self::Stop {
            trigger,
            reason: reason.into(),
        }
    }

    fn or_else(self, next: impl FnOnce() -> Self) -> Self {
        match self {
            Self::Continue => next(),
            stop => stop,
        }
    }
}

pub fn evaluate(
    checkpoint: Checkpoint,
    view: &StateView,
    limits: Limits,
    observed: &Observations<'_>,
) -> StopDecision {
    match checkpoint {
        Checkpoint::PlanAcceptance => plan_acceptance(observed),
        Checkpoint::PreDispatch => invariants(view)
            .or_else(|| retry_bound(view, limits))
            .or_else(|| consecutive_failures(view, limits)),
        Checkpoint::PostResult => authority_modified(observed)
            .or_else(|| forbidden(observed))
            .or_else(|| invariants(view))
            .or_else(|| executor_blocked(view))
            .or_else(|| consecutive_failures(view, limits)),
    }
}

fn plan_acceptance(observed: &Observations<'_>) -> StopDecision {
    match observed.planner {
        Some(PlannerSignal::Conflict(detail)) => {
            return StopDecision::stop(StopTrigger::PlannerConflict, detail.clone());
        }
        Some(PlannerSignal::Ambiguous(detail)) => {
            return StopDecision::stop(StopTrigger::ClarificationRequired, detail.clone());
        }
        Some(PlannerSignal::Unavailable(detail)) => {
            return StopDecision::stop(StopTrigger::PlannerUnavailable, detail.clone());
        }
        None => {}
    }
    match observed.plan_review.and_then(PlanReview::rejection) {
        Some((trigger, reason)) => StopDecision::stop(trigger, reason),
        None => StopDecision::Continue,
    }
}

fn invariants(view: &StateView) -> StopDecision {
    let errors = check_invariants(view);
    if errors.is_empty() {
        return StopDecision::Continue;
    }
    StopDecision::stop(StopTrigger::InvariantViolated, errors.join("; "))
}

/// A live (not decomposed) failed task that used up its retry budget.
fn retry_bound(view: &StateView, limits: Limits) -> StopDecision {
    let superseded = view.plan.superseded();
    let exhausted = view.tasks.iter().find(|(id, state)| {
        state.status == TaskStatus::Failed
            && state.failures > 0
            && state.failures >= limits.max_retries_per_task
            && !superseded.contains(id.as_str())
    });
    let Some((id, state)) = exhausted else {
        return StopDecision::Continue;
    };
    let trigger = if state.last_reason == Some(FailureReason::Timeout) {
        StopTrigger::TaskTimeout
    } else {
        StopTrigger::RetryBoundExceeded
    };
    StopDecision::stop(
        trigger,
        format!(
            "task '{id}' failed {} of {} allowed attempts (last: {})",
            state.failures,
            limits.max_retries_per_task,
            state.last_reason.map_or("unknown", FailureReason::as_str)
        ),
    )
}

fn consecutive_failures(view: &StateView, limits: Limits) -> StopDecision {
    let distinct: BTreeSet<&str> = view.failure_streak.iter().map(String::as_str).collect();
    let count = u32::try_from(distinct.len()).unwrap_or(u32::MAX);
    if count < limits.max_consecutive_failures {
        return StopDecision::Continue;
    }
    StopDecision::stop(
        StopTrigger::ConsecutiveFailures,
        format!(
            "{count} distinct tasks failed consecutively: {}",
            distinct.into_iter().collect::<Vec<_>>().join(", ")
        ),
    )
}

fn executor_blocked(view: &StateView) -> StopDecision {
    match view.last_result() {
        Some(result) if result.outcome == Outcome::Blocked => StopDecision::stop(
            StopTrigger::ExecutorBlocked,
            format!(
                "executor reported task '{}' blocked: {}",
                result.task_id, result.payload.notes
            ),
        ),
        _ => StopDecision::Continue,
    }
}

fn forbidden(observed: &Observations<'_>) -> StopDecision {
    if observed.forbidden_paths.is_empty() {
        return StopDecision::Continue;
    }
    StopDecision::stop(
        StopTrigger::ForbiddenPath,
        format!(
            "executor modified forbidden paths: {}",
            observed.forbidden_paths.join(", ")
        ),
    )
}

fn authority_modified(observed: &Observations<'_>) -> StopDecision {
    if observed.authority_changes.is_empty() {
        return StopDecision::Continue;
    }
    StopDecision::stop(
        StopTrigger::AuthorityModified,
        format!(
            "authoritative files changed during execution: {}",
            observed.authority_changes.join(", ")
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::{LedgerEntry, LedgerEvent, replay};
    use crate::test_support::{entry, failed_result, plan_with_tasks, success_result};

    const LIMITS: Limits = Limits {
        max_retries_per_task: 2,
        max_consecutive_failures: 3,
    };

    fn failures(task_id: &str, reasons: &[FailureReason], start_seq: u64) -> Vec<LedgerEntry> {
        let mut entries = Vec::new();
        let mut seq = start_seq;
        for (index, reason) in reasons.iter().enumerate() {
            let attempt = u32::try_from(index).expect("small") + 1;
            entries.push(entry(
                seq,
                LedgerEvent::Dispatched {
                    task_id: task_id.to_string(),
                    attempt,
                },
            ));
            entries.push(entry(
                seq + 1,
                LedgerEvent::ResultRecorded {
                    result: failed_result(task_id, attempt, *reason),
                },
            ));
            seq += 2;
        }
        entries
    }

    fn view_with(tasks: &[&str], history: Vec<LedgerEntry>) -> StateView {
        let mut entries = vec![entry(
            1,
            LedgerEvent::PlanAccepted {
                plan: plan_with_tasks(tasks),
            },
        )];
        entries.extend(history);
        replay(&entries).expect("replay")
    }

    #[test]
    fn retry_bound_stops_before_third_attempt() {
        let view = view_with(
            &["t1"],
            failures("t1", &[FailureReason::Executor], 2),
        );
        assert_eq!(
            evaluate(Checkpoint::PreDispatch, &view, LIMITS, &Observations::default()),
            StopDecision::Continue
        );

        let view = view_with(
            &["t1"],
            failures("t1", &[FailureReason::Executor, FailureReason::Schema], 2),
        );
        let decision = evaluate(Checkpoint::PreDispatch, &view, LIMITS, &Observations::default());
        let StopDecision::Stop { trigger, reason } = decision else {
            panic!("expected stop");
        };
        assert_eq!(trigger, StopTrigger::RetryBoundExceeded);
        assert_eq!(reason, "task 't1' failed 2 of 2 allowed attempts (last: schema)");
    }

    #[test]
    fn repeated_timeouts_stop_as_task_timeout() {
        let view = view_with(
            &["t1"],
            failures("t1", &[FailureReason::Executor, FailureReason::Timeout], 2),
        );
        let decision = evaluate(Checkpoint::PreDispatch, &view, LIMITS, &Observations::default());
        assert!(matches!(
            decision,
            StopDecision::Stop {
                trigger: StopTrigger::TaskTimeout,
                ..
            }
        ));
    }

    #[test]
    fn consecutive_failures_count_distinct_tasks() {
        let mut history = failures("t1", &[FailureReason::Executor], 2);
        history.extend(failures("t2", &[FailureReason::Executor], 4));
        let view = view_with(&["t1", "t2", "t3"], history.clone());
        assert_eq!(
            evaluate(Checkpoint::PostResult, &view, LIMITS, &Observations::default()),
            StopDecision::Continue
        );

        history.extend(failures("t3", &[FailureReason::Timeout], 6));
        let view = view_with(&["t1", "t2", "t3"], history);
        let decision = evaluate(Checkpoint::PostResult, &view, LIMITS, &Observations::default());
        assert_eq!(
            decision,
            StopDecision::Stop {
                trigger: StopTrigger::ConsecutiveFailures,
                reason: "3 distinct tasks failed consecutively: t1, t2, t3".to_string(),
            }
        );
    }

    #[test]
    fn blocked_result_stops_after_apply() {
        let mut result = success_result("t1", 1);
        result.outcome = Outcome::Blocked;
        result.payload.notes = "needs credentials".to_string();
        let view = view_with(
            &["t1"],
            vec![
                entry(
                    2,
                    LedgerEvent::Dispatched {
                        task_id: "t1".to_string(),
                        attempt: 1,
                    },
                ),
                entry(3, LedgerEvent::ResultRecorded { result }),
            ],
        );
        let decision = evaluate(Checkpoint::PostResult, &view, LIMITS, &Observations::default());
        assert_eq!(
            decision,
            StopDecision::Stop {
                trigger: StopTrigger::ExecutorBlocked,
                reason: "executor reported task 't1' blocked: needs credentials".to_string(),
            }
        );
    }

    #[test]
    fn authority_change_outranks_forbidden_paths() {
        let view = view_with(&["t1"], Vec::new());
        let forbidden = vec!["ai/PLAN.yaml".to_string()];
        let changed = vec!["docs/api.md".to_string()];
        let observed = Observations {
            forbidden_paths: &forbidden,
            authority_changes: &changed,
            ..Observations::default()
        };
        let decision = evaluate(Checkpoint::PostResult, &view, LIMITS, &observed);
        assert!(matches!(
            decision,
            StopDecision::Stop {
                trigger: StopTrigger::AuthorityModified,
                ..
            }
        ));
    }

    #[test]
    fn planner_signals_map_to_triggers() {
        let view = StateView::default();
        let cases = [
            (PlannerSignal::Conflict("a".into()), StopTrigger::PlannerConflict),
            (PlannerSignal::Ambiguous("b".into()), StopTrigger::ClarificationRequired),
            (PlannerSignal::Unavailable("c".into()), StopTrigger::PlannerUnavailable),
        ];
        for (signal, expected) in cases {
            let observed = Observations {
                planner: Some(&signal),
                ..Observations::default()
            };
            let decision = evaluate(Checkpoint::PlanAcceptance, &view, LIMITS, &observed);
            assert!(matches!(decision, StopDecision::Stop { trigger, .. } if trigger == expected));
        }
    }
}
