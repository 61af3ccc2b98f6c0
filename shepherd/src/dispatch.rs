//! The dispatch loop behind `shepherd start`.
//!
//! One pass walks `Idle -> Planning -> Selecting -> Dispatching ->
//! AwaitingResult -> Applying` and returns to `Idle`. The loop leaves through
//! `Stopped` (a stop record was written) or when nothing is selectable.
//! Every ledger commit happens through the [`StateStore`]; this module only
//! decides which commit comes next.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::acceptance::{PlanReview, review_plan};
use crate::core::authority::AuthoritySet;
use crate::core::forbidden::ForbiddenPaths;
use crate::core::progress::derive_progress;
use crate::core::result_validator::{Rejection, ResultValidator};
use crate::core::selector::select_next_task;
use crate::core::stop::{Checkpoint, Limits, Observations, PlannerSignal, StopDecision, evaluate};
use crate::core::types::{
    ActiveTask, FailureReason, Outcome, ResultPayload, StopRecord, StopTrigger, TaskResult,
};
use crate::errors::{ShepherdError, classify};
use crate::io::authority::detect_changes;
use crate::io::clock::Clock;
use crate::io::executor::{ExecRequest, Executor};
use crate::io::planner::{PlanRequest, Planner, PlannerResponse, plan_from_value};
use crate::io::state_store::StateStore;
use crate::io::summary::{append_summary, result_entry, stop_entry};

/// Why [`run_dispatch_loop`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every objective is satisfied.
    Complete,
    /// Nothing is selectable but objectives remain (waiting on the planner).
    Idle,
    /// A stop condition fired and was recorded.
    Stopped(StopRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub dispatched: u32,
    pub stop: LoopStop,
}

/// Fixed inputs of one run.
pub struct DispatchSettings<'a> {
    pub authority: &'a AuthoritySet,
    pub forbidden: &'a ForbiddenPaths,
    pub limits: Limits,
    pub task_timeout: Duration,
    pub strict_results: bool,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Planning,
    Selecting,
    Dispatching(String),
    AwaitingResult(ActiveTask),
    Applying { active: ActiveTask, reply: Result<Value> },
    Stopped(StopRecord),
    Finished,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Selecting => "selecting",
            Self::Dispatching(_) => "dispatching",
            Self::AwaitingResult(_) => "awaiting_result",
            Self::Applying { .. } => "applying",
            Self::Stopped(_) => "stopped",
            Self::Finished => "finished",
        }
    }
}

/// Drive the loop until a stop is recorded or nothing is left to dispatch.
///
/// `on_result` sees every recorded result. Errors are returned only for
/// failures the loop cannot record (I/O, ledger refusal); policy failures
/// become stop records.
pub fn run_dispatch_loop<E, P, F>(
    store: &mut StateStore,
    settings: &DispatchSettings<'_>,
    executor: &E,
    planner: &P,
    clock: &dyn Clock,
    on_result: F,
) -> Result<LoopOutcome>
where
    E: Executor + ?Sized,
    P: Planner + ?Sized,
    F: FnMut(&TaskResult),
{
    let mut run = Run {
        store,
        settings,
        executor,
        planner,
        clock,
        on_result,
        dispatched: 0,
    };
    let mut phase = Phase::Idle;
    loop {
        debug!(phase = phase.name(), "dispatch phase");
        phase = match phase {
            Phase::Idle => Phase::Planning,
            Phase::Planning => run.plan()?,
            Phase::Selecting => run.select()?,
            Phase::Dispatching(task_id) => run.dispatch(&task_id)?,
            Phase::AwaitingResult(active) => run.await_result(active)?,
            Phase::Applying { active, reply } => run.apply(&active, reply)?,
            Phase::Stopped(record) => {
                return Ok(LoopOutcome {
                    dispatched: run.dispatched,
                    stop: LoopStop::Stopped(record),
                });
            }
            Phase::Finished => {
                let complete = derive_progress(run.store.view()).all_satisfied();
                info!(dispatched = run.dispatched, complete, "nothing left to dispatch");
                return Ok(LoopOutcome {
                    dispatched: run.dispatched,
                    stop: if complete {
                        LoopStop::Complete
                    } else {
                        LoopStop::Idle
                    },
                });
            }
        };
    }
}

struct Run<'s, 'a, E: ?Sized, P: ?Sized, F> {
    store: &'s mut StateStore,
    settings: &'s DispatchSettings<'a>,
    executor: &'s E,
    planner: &'s P,
    clock: &'s dyn Clock,
    on_result: F,
    dispatched: u32,
}

impl<E, P, F> Run<'_, '_, E, P, F>
where
    E: Executor + ?Sized,
    P: Planner + ?Sized,
    F: FnMut(&TaskResult),
{
    fn plan(&mut self) -> Result<Phase> {
        let view = self.store.view();
        let progress = derive_progress(view);
        let request = PlanRequest {
            documents: self.settings.authority.documents().collect(),
            plan: &view.plan,
            progress: &progress,
            last_result: view.last_result(),
            last_stop: self.store.last_stop(),
        };
        let response = self.planner.request_plan(&request);

        let (signal, review) = match response {
            Ok(PlannerResponse::Unchanged) => return Ok(Phase::Selecting),
            Ok(PlannerResponse::Plan { plan }) => match plan_from_value(plan) {
                Ok(plan) => {
                    let review = review_plan(view, &plan, self.settings.authority);
                    if review.is_accepted() {
                        self.store.accept_plan(plan, self.clock)?;
                        return Ok(Phase::Selecting);
                    }
                    (None, review)
                }
                Err(errors) => (None, PlanReview {
                    invalid: errors,
                    ..PlanReview::default()
                }),
            },
            Ok(PlannerResponse::Conflict { detail }) => {
                (Some(PlannerSignal::Conflict(detail)), PlanReview::default())
            }
            Ok(PlannerResponse::Ambiguous { detail }) => {
                (Some(PlannerSignal::Ambiguous(detail)), PlanReview::default())
            }
            Err(err) => match classify(&err) {
                Some(ShepherdError::Schema(message)) => (None, PlanReview {
                    invalid: vec![message.clone()],
                    ..PlanReview::default()
                }),
                _ => (
                    Some(PlannerSignal::Unavailable(format!("{err:#}"))),
                    PlanReview::default(),
                ),
            },
        };

        let observed = Observations {
            planner: signal.as_ref(),
            plan_review: Some(&review),
            ..Observations::default()
        };
        match evaluate(Checkpoint::PlanAcceptance, view, self.settings.limits, &observed) {
            StopDecision::Stop { trigger, reason } => self.stop(trigger, &reason),
            StopDecision::Continue => Err(anyhow!(
                "planner answer was neither accepted nor rejected"
            )),
        }
    }

    fn select(&mut self) -> Result<Phase> {
        let view = self.store.view();
        if let StopDecision::Stop { trigger, reason } = evaluate(
            Checkpoint::PreDispatch,
            view,
            self.settings.limits,
            &Observations::default(),
        ) {
            return self.stop(trigger, &reason);
        }
        Ok(match select_next_task(view) {
            Some(task) => Phase::Dispatching(task.id.clone()),
            None => Phase::Finished,
        })
    }

    fn dispatch(&mut self, task_id: &str) -> Result<Phase> {
        let active = self.store.begin_dispatch(task_id, self.clock)?;
        self.dispatched += 1;
        info!(task_id, attempt = active.attempt, "task dispatched");
        Ok(Phase::AwaitingResult(active))
    }

    fn await_result(&mut self, active: ActiveTask) -> Result<Phase> {
        let task = self
            .store
            .view()
            .plan
            .task(&active.task_id)
            .cloned()
            .ok_or_else(|| anyhow!("dispatched task '{}' is not in the plan", active.task_id))?;
        let timeout = self.settings.task_timeout;
        let started = Instant::now();
        let reply = self.executor.execute(&ExecRequest {
            task: &task,
            attempt: active.attempt,
            timeout,
        });
        let reply = match reply {
            Ok(_) if started.elapsed() > timeout => Err(ShepherdError::Timeout {
                seconds: timeout.as_secs(),
            }
            .into()),
            other => other,
        };
        Ok(Phase::Applying { active, reply })
    }

    fn apply(&mut self, active: &ActiveTask, reply: Result<Value>) -> Result<Phase> {
        let recorded_at = self.clock.timestamp();
        let mut forbidden_paths = Vec::new();
        let result = match reply {
            Ok(value) => {
                let validator = ResultValidator {
                    forbidden: self.settings.forbidden,
                    strict: self.settings.strict_results,
                };
                match validator.validate(
                    self.store.view(),
                    &active.task_id,
                    active.attempt,
                    &value,
                    &recorded_at,
                ) {
                    Ok(result) => result,
                    Err(rejection) => {
                        warn!(task_id = %active.task_id, ?rejection, "executor reply rejected");
                        if let Rejection::ForbiddenPaths { paths, .. } = &rejection {
                            forbidden_paths.clone_from(paths);
                        }
                        rejection
                            .into_failed_result(&active.task_id, active.attempt, &recorded_at)
                            .ok_or_else(|| {
                                ShepherdError::Concurrency(format!(
                                    "reply for '{}' attempt {} is not in flight",
                                    active.task_id, active.attempt
                                ))
                            })?
                    }
                }
            }
            Err(err) => {
                let reason = match classify(&err) {
                    Some(ShepherdError::Timeout { .. }) => FailureReason::Timeout,
                    Some(ShepherdError::Schema(_)) => FailureReason::Schema,
                    _ => FailureReason::ExecutorError,
                };
                warn!(
                    task_id = %active.task_id,
                    reason = reason.as_str(),
                    error = %format!("{err:#}"),
                    "executor failed"
                );
                TaskResult {
                    task_id: active.task_id.clone(),
                    attempt: active.attempt,
                    outcome: Outcome::Failed,
                    reason: Some(reason),
                    payload: ResultPayload {
                        notes: format!("{err:#}"),
                        ..ResultPayload::default()
                    },
                    recorded_at,
                }
            }
        };

        // Post-result checks see the view with the result applied; a stop they
        // raise lands in the same ledger write as the result.
        let authority_changes = detect_changes(self.store.paths(), self.settings.authority);
        let observed = Observations {
            forbidden_paths: &forbidden_paths,
            authority_changes: &authority_changes,
            ..Observations::default()
        };
        let limits = self.settings.limits;
        let stop = self
            .store
            .apply_result_with(result.clone(), self.clock, |after| {
                match evaluate(Checkpoint::PostResult, after, limits, &observed) {
                    StopDecision::Stop { trigger, reason } => Some((trigger, reason)),
                    StopDecision::Continue => None,
                }
            })?;
        let summary_path = &self.store.paths().summary_path;
        append_summary(summary_path, &result_entry(&result))?;
        info!(
            task_id = %result.task_id,
            attempt = result.attempt,
            outcome = ?result.outcome,
            "result recorded"
        );
        (self.on_result)(&result);

        match stop {
            Some(record) => {
                append_summary(summary_path, &stop_entry(&record))?;
                Ok(Phase::Stopped(record))
            }
            None => Ok(Phase::Idle),
        }
    }

    fn stop(&mut self, trigger: StopTrigger, reason: &str) -> Result<Phase> {
        let record = self.store.record_stop(trigger, reason, self.clock)?;
        append_summary(&self.store.paths().summary_path, &stop_entry(&record))?;
        Ok(Phase::Stopped(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::io::authority::{forbidden_paths, load_authority};
    use crate::test_support::{
        FixedClock, ScriptedExecutor, ScriptedPlanner, Workspace, plan_with_tasks, reply,
    };

    struct Harness {
        ws: Workspace,
        store: StateStore,
        authority: AuthoritySet,
        forbidden: ForbiddenPaths,
        clock: FixedClock,
    }

    impl Harness {
        fn new() -> Self {
            let ws = Workspace::new().with_goal_document();
            let clock = FixedClock::default();
            let paths = ws.paths();
            let store = StateStore::open(&paths).expect("open");
            let authority = load_authority(&paths, &clock).expect("authority");
            let forbidden = forbidden_paths(&paths, &authority);
            Self {
                ws,
                store,
                authority,
                forbidden,
                clock,
            }
        }

        fn run(&mut self, executor: &ScriptedExecutor, planner: &ScriptedPlanner) -> LoopOutcome {
            let settings = DispatchSettings {
                authority: &self.authority,
                forbidden: &self.forbidden,
                limits: Limits {
                    max_retries_per_task: 2,
                    max_consecutive_failures: 3,
                },
                task_timeout: Duration::from_secs(60),
                strict_results: true,
            };
            run_dispatch_loop(&mut self.store, &settings, executor, planner, &self.clock, |_| {})
                .expect("loop")
        }
    }

    fn stopped_trigger(outcome: &LoopOutcome) -> StopTrigger {
        match &outcome.stop {
            LoopStop::Stopped(record) => record.trigger,
            other => panic!("expected a stop, got {other:?}"),
        }
    }

    #[test]
    fn runs_plan_to_completion_in_order() {
        let mut h = Harness::new();
        let executor = ScriptedExecutor::new([Ok(reply("success")), Ok(reply("success"))]);
        let planner = ScriptedPlanner::proposing(&plan_with_tasks(&["t1", "t2"]));

        let outcome = h.run(&executor, &planner);

        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.dispatched, 2);
        assert_eq!(
            executor.calls(),
            vec![("t1".to_string(), 1), ("t2".to_string(), 1)]
        );
        assert!(h.ws.read("ai/SUMMARY.md").contains("Task t2 attempt 1: success"));
    }

    #[test]
    fn no_plan_is_idle_without_dispatch() {
        let mut h = Harness::new();
        let executor = ScriptedExecutor::default();
        let planner = ScriptedPlanner::default();
        let outcome = h.run(&executor, &planner);
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(outcome.stop, LoopStop::Idle);
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn blocked_result_stops_without_touching_plan() {
        let mut h = Harness::new();
        let executor = ScriptedExecutor::new([Ok(reply("blocked"))]);
        let planner = ScriptedPlanner::proposing(&plan_with_tasks(&["t1", "t2"]));

        let outcome = h.run(&executor, &planner);

        assert_eq!(stopped_trigger(&outcome), StopTrigger::ExecutorBlocked);
        assert_eq!(h.store.view().status_of("t1"), Some(TaskStatus::Blocked));
        assert_eq!(h.store.view().plan, plan_with_tasks(&["t1", "t2"]));
        assert!(h.ws.read("ai/SUMMARY.md").contains("STOPPED #1: executor-blocked"));
    }

    #[test]
    fn failures_retry_until_bound() {
        let mut h = Harness::new();
        let executor = ScriptedExecutor::new([Ok(reply("failed")), Ok(reply("failed"))]);
        let planner = ScriptedPlanner::proposing(&plan_with_tasks(&["t1"]));

        let outcome = h.run(&executor, &planner);

        assert_eq!(stopped_trigger(&outcome), StopTrigger::RetryBoundExceeded);
        assert_eq!(
            executor.calls(),
            vec![("t1".to_string(), 1), ("t1".to_string(), 2)]
        );
    }

    #[test]
    fn repeated_timeouts_stop_with_task_timeout() {
        let mut h = Harness::new();
        let timeout = || Err(ShepherdError::Timeout { seconds: 60 }.into());
        let executor = ScriptedExecutor::new([timeout(), timeout()]);
        let planner = ScriptedPlanner::proposing(&plan_with_tasks(&["t1"]));

        let outcome = h.run(&executor, &planner);

        assert_eq!(stopped_trigger(&outcome), StopTrigger::TaskTimeout);
        let result = h.store.view().last_result().expect("result");
        assert_eq!(result.reason, Some(FailureReason::Timeout));
    }

    #[test]
    fn forbidden_change_is_failed_attempt_and_stop() {
        let mut h = Harness::new();
        let mut bad = reply("success");
        bad["files_changed"] = serde_json::json!(["src/lib.rs", "docs/goals.md"]);
        let executor = ScriptedExecutor::new([Ok(bad)]);
        let planner = ScriptedPlanner::proposing(&plan_with_tasks(&["t1"]));

        let outcome = h.run(&executor, &planner);

        assert_eq!(stopped_trigger(&outcome), StopTrigger::ForbiddenPath);
        let result = h.store.view().last_result().expect("result");
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.reason, Some(FailureReason::ForbiddenPath));
    }

    #[test]
    fn schema_violation_counts_as_failed_attempt() {
        let mut h = Harness::new();
        let executor = ScriptedExecutor::new([
            Ok(serde_json::json!({"status": "done"})),
            Ok(reply("success")),
        ]);
        let planner = ScriptedPlanner::proposing(&plan_with_tasks(&["t1"]));

        let outcome = h.run(&executor, &planner);

        assert_eq!(outcome.stop, LoopStop::Complete);
        let reasons: Vec<_> = h.store.view().results.iter().map(|r| r.reason).collect();
        assert_eq!(reasons, vec![Some(FailureReason::Schema), None]);
    }

    #[test]
    fn untraceable_plan_is_rejected_before_dispatch() {
        let mut h = Harness::new();
        let mut plan = plan_with_tasks(&["t1"]);
        plan.objectives[0].sources = vec!["docs/unlisted.md".to_string()];
        let executor = ScriptedExecutor::default();
        let planner = ScriptedPlanner::proposing(&plan);

        let outcome = h.run(&executor, &planner);

        assert_eq!(stopped_trigger(&outcome), StopTrigger::UntraceableObjective);
        assert!(executor.calls().is_empty());
        assert!(h.store.view().plan.tasks.is_empty());
    }

    #[test]
    fn planner_signals_map_to_triggers() {
        for (response, trigger) in [
            (
                Ok(PlannerResponse::Conflict {
                    detail: "docs disagree".to_string(),
                }),
                StopTrigger::PlannerConflict,
            ),
            (
                Ok(PlannerResponse::Ambiguous {
                    detail: "which API?".to_string(),
                }),
                StopTrigger::ClarificationRequired,
            ),
            (
                Err(ShepherdError::Schema("bad response".to_string()).into()),
                StopTrigger::PlanInvalid,
            ),
            (Err(anyhow!("planner crashed")), StopTrigger::PlannerUnavailable),
        ] {
            let mut h = Harness::new();
            let planner = ScriptedPlanner::new([response]);
            let outcome = h.run(&ScriptedExecutor::default(), &planner);
            assert_eq!(stopped_trigger(&outcome), trigger);
        }
    }

    #[test]
    fn authority_edit_during_execution_stops() {
        let mut h = Harness::new();
        h.ws.write("docs/goals.md", "# Goals\n\nShip something else.\n");
        let executor = ScriptedExecutor::new([Ok(reply("success"))]);
        let planner = ScriptedPlanner::proposing(&plan_with_tasks(&["t1"]));

        let outcome = h.run(&executor, &planner);

        assert_eq!(stopped_trigger(&outcome), StopTrigger::AuthorityModified);
        assert_eq!(h.store.view().status_of("t1"), Some(TaskStatus::Succeeded));
    }
}
