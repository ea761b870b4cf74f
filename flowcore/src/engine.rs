//! Orchestration engine: owns one workflow state and drives the run loop.
//!
//! Each loop pass asks the policy for a [`Decision`], applies its actions,
//! dispatches every `WAITING` step to the executor, folds the results back
//! into the state and finalizes when the decision asked for it. All state
//! changes go through [`crate::core::transitions`]; the engine never edits the
//! state directly.

use std::fmt;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::budget_exhausted;
use crate::core::context::{ContextProvider, ExecutionContext};
use crate::core::schema::{ensure_invariants, state_from_value};
use crate::core::transitions::{
    TransitionError, apply_action, apply_execution_result, finalize, mark_in_progress,
};
use crate::core::types::{
    Action, Decision, ErrorKind, ExecutionError, ExecutionResult, StepStatus, WorkflowState,
    WorkflowStatus,
};
use crate::executor::{ExecRequest, WorkExecutor};
use crate::io::clock::SystemContextProvider;
use crate::io::config::EngineConfig;
use crate::policy::DecisionPolicy;

/// Safety limits for [`Engine::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Policy invocations allowed before the run fails.
    pub max_iterations: u32,
    /// Wall-clock budget, checked once per iteration.
    pub timeout: Option<Duration>,
    /// `WAITING` steps dispatched at once. `1` runs them sequentially.
    pub max_concurrency: usize,
    pub max_actions_per_decision: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            timeout: None,
            max_concurrency: 1,
            max_actions_per_decision: 256,
        }
    }
}

impl RunOptions {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            timeout: (cfg.timeout_secs > 0).then(|| Duration::from_secs(cfg.timeout_secs)),
            max_concurrency: cfg.max_concurrency,
            max_actions_per_decision: cfg.max_actions_per_decision,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid initial state: {0}")]
    InvalidInitialState(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("policy failed at iteration {iteration}")]
    Policy {
        iteration: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("executor raised for step '{step_id}'")]
    Executor {
        step_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("max iterations exceeded ({max_iterations})")]
    MaxIterationsExceeded { max_iterations: u32 },
    #[error("timeout exceeded after {elapsed:?} (budget {timeout:?})")]
    TimeoutExceeded { elapsed: Duration, timeout: Duration },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInitialState(_) => ErrorKind::ValidationError,
            EngineError::Transition(err) => err.kind(),
            EngineError::Policy { .. } | EngineError::Executor { .. } => ErrorKind::ProviderError,
            EngineError::MaxIterationsExceeded { .. } | EngineError::TimeoutExceeded { .. } => {
                ErrorKind::Timeout
            }
        }
    }
}

/// What one completed loop pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationOutcome {
    /// Zero-based iteration index.
    pub iteration: u32,
    pub actions_applied: usize,
    pub steps_executed: usize,
    pub finalized: bool,
    pub status: WorkflowStatus,
}

pub struct Engine {
    state: WorkflowState,
    contexts: Box<dyn ContextProvider>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Take ownership of `state` after checking its semantic invariants.
    ///
    /// Contexts come from the real clock until
    /// [`Engine::with_context_provider`] swaps in another source.
    pub fn new(state: WorkflowState) -> Result<Self, EngineError> {
        ensure_invariants(&state)
            .map_err(|err| EngineError::InvalidInitialState(format!("{err:#}")))?;
        Ok(Self {
            state,
            contexts: Box::new(SystemContextProvider),
        })
    }

    /// Build from an untyped document, reporting every missing or ill-typed
    /// field before deserializing.
    pub fn from_value(value: Value) -> Result<Self, EngineError> {
        let state = state_from_value(value)
            .map_err(|err| EngineError::InvalidInitialState(format!("{err:#}")))?;
        Self::new(state)
    }

    pub fn with_context_provider(mut self, contexts: impl ContextProvider + 'static) -> Self {
        self.contexts = Box::new(contexts);
        self
    }

    /// Deep copy of the owned state.
    pub fn current_state(&self) -> WorkflowState {
        self.state.clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state.status
    }

    /// Apply every action in order, then finalize if requested.
    ///
    /// All-or-nothing: on error the owned state is left as it was.
    pub fn apply_decision(
        &mut self,
        decision: &Decision,
        ctx: &ExecutionContext,
    ) -> Result<(), TransitionError> {
        self.apply_batch(&decision.actions, decision.finalize, ctx)
    }

    /// Move a `WAITING` step to `IN_PROGRESS` for callers dispatching work
    /// themselves.
    pub fn start_step(
        &mut self,
        step_id: &str,
        ctx: &ExecutionContext,
    ) -> Result<(), TransitionError> {
        self.state = mark_in_progress(&self.state, step_id, ctx)?;
        Ok(())
    }

    /// Settle a step with `result`.
    ///
    /// A step still `WAITING` is started first, so a hand-driven workflow can
    /// go straight from request to result. Either both transitions land or
    /// neither does.
    pub fn apply_execution_result(
        &mut self,
        step_id: &str,
        result: &ExecutionResult,
        ctx: &ExecutionContext,
    ) -> Result<(), TransitionError> {
        let waiting = self
            .state
            .step(step_id)
            .is_some_and(|step| step.status == StepStatus::Waiting);
        let next = if waiting {
            let started = mark_in_progress(&self.state, step_id, ctx)?;
            apply_execution_result(&started, step_id, result, ctx)?
        } else {
            apply_execution_result(&self.state, step_id, result, ctx)?
        };
        self.state = next;
        Ok(())
    }

    pub fn finalize(&mut self, ctx: &ExecutionContext) -> Result<(), TransitionError> {
        self.state = finalize(&self.state, ctx)?;
        Ok(())
    }

    /// Drive the loop until the workflow is terminal or a safety limit trips.
    pub fn run(
        &mut self,
        policy: &dyn DecisionPolicy,
        executor: &dyn WorkExecutor,
        options: &RunOptions,
    ) -> Result<WorkflowState, EngineError> {
        self.run_with(policy, executor, options, |_| {})
    }

    /// [`Engine::run`] with a callback after every completed iteration.
    ///
    /// On error the engine keeps the last consistent state; callers can read
    /// it through [`Engine::current_state`].
    #[instrument(skip_all, fields(goal_id = %self.state.goal_id, max_iterations = options.max_iterations, max_concurrency = options.max_concurrency))]
    pub fn run_with<F>(
        &mut self,
        policy: &dyn DecisionPolicy,
        executor: &dyn WorkExecutor,
        options: &RunOptions,
        mut on_iteration: F,
    ) -> Result<WorkflowState, EngineError>
    where
        F: FnMut(&IterationOutcome),
    {
        let started = Instant::now();
        let mut iteration = 0u32;

        while !self.state.status.is_terminal() {
            if iteration >= options.max_iterations {
                warn!(iteration, "max iterations exceeded");
                return Err(EngineError::MaxIterationsExceeded {
                    max_iterations: options.max_iterations,
                });
            }
            if let Some(elapsed) = budget_exhausted(started, options.timeout) {
                warn!(iteration, elapsed_ms = elapsed.as_millis() as u64, "run timed out");
                return Err(EngineError::TimeoutExceeded {
                    elapsed,
                    timeout: options.timeout.unwrap_or_default(),
                });
            }

            let ctx = self.contexts.context(iteration);
            let view = self.current_state();
            let decision = policy
                .decide(&view)
                .map_err(|source| EngineError::Policy { iteration, source })?;
            if decision.actions.len() > options.max_actions_per_decision {
                return Err(TransitionError::Validation(format!(
                    "decision has {} actions; limit is {}",
                    decision.actions.len(),
                    options.max_actions_per_decision
                ))
                .into());
            }

            // Finalize after dispatch so steps requested alongside `finalize`
            // settle first.
            self.apply_batch(&decision.actions, false, &ctx)?;
            let steps_executed = self.dispatch_waiting(executor, options.max_concurrency, &ctx)?;
            if decision.finalize {
                self.finalize(&ctx)?;
            }

            let outcome = IterationOutcome {
                iteration,
                actions_applied: decision.actions.len(),
                steps_executed,
                finalized: decision.finalize,
                status: self.state.status,
            };
            debug!(
                iteration,
                actions = outcome.actions_applied,
                steps = outcome.steps_executed,
                status = %outcome.status,
                "iteration complete"
            );
            on_iteration(&outcome);
            iteration += 1;
        }

        info!(status = %self.state.status, iterations = iteration, "run finished");
        Ok(self.current_state())
    }

    fn apply_batch(
        &mut self,
        actions: &[Action],
        finalize_after: bool,
        ctx: &ExecutionContext,
    ) -> Result<(), TransitionError> {
        let mut next = self.state.clone();
        for action in actions {
            next = apply_action(&next, action, ctx)?;
        }
        if finalize_after {
            next = finalize(&next, ctx)?;
        }
        self.state = next;
        Ok(())
    }

    /// Run every `WAITING` step, in step-id order or in bounded parallel chunks.
    fn dispatch_waiting(
        &mut self,
        executor: &dyn WorkExecutor,
        max_concurrency: usize,
        ctx: &ExecutionContext,
    ) -> Result<usize, EngineError> {
        let waiting: Vec<String> = self
            .state
            .steps_with_status(StepStatus::Waiting)
            .map(|(id, _)| id.to_string())
            .collect();

        if max_concurrency <= 1 {
            for step_id in &waiting {
                self.dispatch_one(executor, step_id, ctx)?;
            }
        } else {
            for chunk in waiting.chunks(max_concurrency) {
                self.dispatch_parallel(executor, chunk, ctx)?;
            }
        }
        Ok(waiting.len())
    }

    #[instrument(skip(self, executor, ctx))]
    fn dispatch_one(
        &mut self,
        executor: &dyn WorkExecutor,
        step_id: &str,
        ctx: &ExecutionContext,
    ) -> Result<(), EngineError> {
        self.state = mark_in_progress(&self.state, step_id, ctx)?;
        let step = self
            .state
            .step(step_id)
            .ok_or_else(|| TransitionError::UnknownStep(step_id.to_string()))?;
        let request = ExecRequest {
            step_id,
            kind: &step.kind,
            payload: &step.payload,
        };
        let outcome = executor.execute(&request, ctx);
        self.settle(step_id, outcome, ctx)
    }

    /// Execute `chunk` on scoped threads and apply results as they settle.
    ///
    /// Result application stays on this thread. If any executor raises, the
    /// remaining results are still recorded before the first raise is returned.
    fn dispatch_parallel(
        &mut self,
        executor: &dyn WorkExecutor,
        chunk: &[String],
        ctx: &ExecutionContext,
    ) -> Result<(), EngineError> {
        let mut jobs = Vec::with_capacity(chunk.len());
        for step_id in chunk {
            self.state = mark_in_progress(&self.state, step_id, ctx)?;
            let step = self
                .state
                .step(step_id)
                .ok_or_else(|| TransitionError::UnknownStep(step_id.clone()))?;
            jobs.push((step_id.as_str(), step.kind.clone(), step.payload.clone()));
        }
        debug!(steps = jobs.len(), "dispatching in parallel");

        let mut first_raise = None;
        thread::scope(|scope| -> Result<(), EngineError> {
            let (tx, rx) = mpsc::channel();
            for (step_id, kind, payload) in &jobs {
                let tx = tx.clone();
                scope.spawn(move || {
                    let request = ExecRequest {
                        step_id: *step_id,
                        kind: kind.as_str(),
                        payload,
                    };
                    let outcome = executor.execute(&request, ctx);
                    // Receiver only goes away when the loop bails on a transition error.
                    let _ = tx.send((*step_id, outcome));
                });
            }
            drop(tx);

            for (step_id, outcome) in rx {
                match self.settle(step_id, outcome, ctx) {
                    Ok(()) => {}
                    Err(err @ EngineError::Executor { .. }) => {
                        if first_raise.is_none() {
                            first_raise = Some(err);
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })?;

        match first_raise {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fold one executor outcome into the state.
    ///
    /// A raise is recorded as a `PROVIDER_ERROR` failure before it is returned.
    fn settle(
        &mut self,
        step_id: &str,
        outcome: anyhow::Result<ExecutionResult>,
        ctx: &ExecutionContext,
    ) -> Result<(), EngineError> {
        match outcome {
            Ok(result) => {
                debug!(step_id, status = ?result.status, "step settled");
                self.apply_execution_result(step_id, &result, ctx)?;
                Ok(())
            }
            Err(source) => {
                let message = format!("{source:#}");
                warn!(step_id, error = %message, "executor raised");
                let synthesized =
                    ExecutionResult::fail(ExecutionError::new(ErrorKind::ProviderError, message));
                self.apply_execution_result(step_id, &synthesized, ctx)?;
                Err(EngineError::Executor {
                    step_id: step_id.to_string(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LogEvent;
    use crate::test_support::{fixed_context, fixed_provider, initial_state};
    use serde_json::json;

    fn engine() -> Engine {
        Engine::new(initial_state("g1"))
            .expect("engine")
            .with_context_provider(fixed_provider())
    }

    #[test]
    fn new_rejects_empty_goal_id() {
        let err = Engine::new(initial_state("")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInitialState(_)));
        assert!(err.to_string().contains("goalId"));
    }

    /// Missing fields are named in the error instead of surfacing later.
    #[test]
    fn from_value_reports_missing_fields() {
        let err = Engine::from_value(json!({"goalId": "g1", "status": "RUNNING"})).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("openSteps"), "{message}");
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn from_value_accepts_complete_document() {
        let engine = Engine::from_value(json!({
            "goalId": "g1",
            "status": "RUNNING",
            "openSteps": {},
            "artifacts": {},
            "log": []
        }))
        .expect("engine");
        assert_eq!(engine.current_state(), initial_state("g1"));
    }

    #[test]
    fn current_state_is_a_detached_copy() {
        let engine = engine();
        let mut copy = engine.current_state();
        copy.artifacts.insert("k".to_string(), json!(1));
        assert!(engine.current_state().artifacts.is_empty());
    }

    #[test]
    fn apply_decision_is_all_or_nothing() {
        let mut engine = engine();
        let ctx = fixed_context();
        let decision = Decision::continue_with(vec![
            Action::annotate("k", json!(1)),
            Action::request_work_as("s1", "greet", json!(null)),
            Action::request_work_as("s1", "greet", json!(null)),
        ]);

        let err = engine.apply_decision(&decision, &ctx).unwrap_err();

        assert_eq!(err, TransitionError::DuplicateStep("s1".to_string()));
        assert_eq!(engine.current_state(), initial_state("g1"));
    }

    #[test]
    fn apply_decision_finalizes_when_requested() {
        let mut engine = engine();
        let ctx = fixed_context();

        engine
            .apply_decision(
                &Decision::finalize_with(vec![Action::annotate("k", json!("v"))]),
                &ctx,
            )
            .expect("apply");

        let state = engine.current_state();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.log.last().expect("entry").event, LogEvent::Finalized);
    }

    #[test]
    fn public_methods_drive_request_start_result_finalize() {
        let mut engine = engine();
        let ctx = fixed_context();

        engine
            .apply_decision(
                &Decision::continue_with(vec![
                    Action::request_work_as("s1", "greet", json!({"name": "ada"})),
                    Action::request_work_as("s2", "greet", json!({"name": "grace"})),
                ]),
                &ctx,
            )
            .expect("request");
        engine.start_step("s1", &ctx).expect("start");
        assert_eq!(
            engine.current_state().step("s1").expect("s1").status,
            StepStatus::InProgress
        );
        engine
            .apply_execution_result("s1", &ExecutionResult::ok_with(json!("hi ada")), &ctx)
            .expect("s1 result");
        engine
            .apply_execution_result("s2", &ExecutionResult::ok(), &ctx)
            .expect("s2 result from WAITING");
        engine
            .apply_decision(&Decision::finalize_with(Vec::new()), &ctx)
            .expect("finalize");

        let state = engine.current_state();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.step("s1").expect("s1").status, StepStatus::Done);
        assert_eq!(state.step("s2").expect("s2").status, StepStatus::Done);
        let events: Vec<LogEvent> = state.log.iter().map(|entry| entry.event).collect();
        assert_eq!(
            events.iter().filter(|event| **event == LogEvent::StepStarted).count(),
            2
        );
    }

    #[test]
    fn settled_step_rejects_a_second_result_without_changing_state() {
        let mut engine = engine();
        let ctx = fixed_context();
        engine
            .apply_decision(
                &Decision::continue_with(vec![Action::request_work_as("s1", "greet", json!(null))]),
                &ctx,
            )
            .expect("request");
        engine
            .apply_execution_result("s1", &ExecutionResult::ok(), &ctx)
            .expect("result");
        let before = engine.current_state();

        let err = engine
            .apply_execution_result("s1", &ExecutionResult::ok(), &ctx)
            .unwrap_err();

        assert!(matches!(err, TransitionError::IllegalStepTransition { .. }));
        assert_eq!(engine.current_state(), before);
        assert!(matches!(
            engine.start_step("missing", &ctx).unwrap_err(),
            TransitionError::UnknownStep(_)
        ));
    }

    #[test]
    fn oversized_decision_is_rejected_before_application() {
        let mut engine = engine();
        let policy = |_: &WorkflowState| -> anyhow::Result<Decision> {
            Ok(Decision::continue_with(vec![
                Action::annotate("a", json!(1)),
                Action::annotate("b", json!(2)),
            ]))
        };
        let executor = crate::test_support::ScriptedExecutor::always_ok();
        let options = RunOptions {
            max_actions_per_decision: 1,
            ..RunOptions::default()
        };

        let err = engine.run(&policy, &executor, &options).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(engine.current_state().artifacts.is_empty());
    }

    #[test]
    fn policy_error_halts_with_iteration() {
        let mut engine = engine();
        let policy =
            |_: &WorkflowState| -> anyhow::Result<Decision> { Err(anyhow::anyhow!("no plan")) };
        let executor = crate::test_support::ScriptedExecutor::always_ok();

        let err = engine
            .run(&policy, &executor, &RunOptions::default())
            .unwrap_err();

        assert!(matches!(err, EngineError::Policy { iteration: 0, .. }));
    }

    #[test]
    fn zero_timeout_fails_before_first_decision() {
        let mut engine = engine();
        let policy = crate::test_support::ScriptedPolicy::new(Vec::new());
        let executor = crate::test_support::ScriptedExecutor::always_ok();

        let err = engine
            .run(
                &policy,
                &executor,
                &RunOptions::default().with_timeout(Duration::ZERO),
            )
            .unwrap_err();

        assert!(matches!(err, EngineError::TimeoutExceeded { .. }));
        assert_eq!(policy.calls(), 0);
    }

    #[test]
    fn run_options_follow_config() {
        let cfg = EngineConfig {
            max_iterations: 5,
            timeout_secs: 9,
            max_concurrency: 3,
            ..EngineConfig::default()
        };
        let options = RunOptions::from_config(&cfg);
        assert_eq!(options.max_iterations, 5);
        assert_eq!(options.timeout, Some(Duration::from_secs(9)));
        assert_eq!(options.max_concurrency, 3);
        assert_eq!(RunOptions::from_config(&EngineConfig::default()).timeout, None);
    }
}
