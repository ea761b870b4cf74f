//! Pure state transitions for workflow runs.
//!
//! Every function takes the previous state by reference and returns a new
//! state. Inputs are never mutated, and the same `(state, event, context)`
//! triple always produces an equal result.

use serde_json::{Value, json};
use thiserror::Error;

use crate::core::context::ExecutionContext;
use crate::core::types::{
    APPROVAL_KIND, Action, ErrorKind, ExecutionResult, LogEntry, LogEvent, StepState, StepStatus,
    WorkflowState, WorkflowStatus,
};

/// Structural errors raised by transitions.
///
/// These indicate a policy or executor bug and halt the run loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("step '{0}' already exists")]
    DuplicateStep(String),
    #[error("unknown step '{0}'")]
    UnknownStep(String),
    #[error("step '{step_id}' cannot move from {from} to {to}")]
    IllegalStepTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },
    #[error("cannot finalize with unsettled steps: {}", .0.join(", "))]
    UnsettledSteps(Vec<String>),
}

impl TransitionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ValidationError
    }
}

/// Apply one policy action.
///
/// `REQUEST_WORK` / `REQUEST_APPROVAL` insert a `WAITING` step (generating an
/// id when none is given); `ANNOTATE` overwrites `artifacts[key]`.
pub fn apply_action(
    state: &WorkflowState,
    action: &Action,
    ctx: &ExecutionContext,
) -> Result<WorkflowState, TransitionError> {
    if state.status.is_terminal() {
        return Err(TransitionError::Validation(format!(
            "workflow '{}' is {}; {} rejected",
            state.goal_id,
            state.status,
            action.tag()
        )));
    }
    validate_action(action)?;

    let mut next = state.clone();
    match action {
        Action::RequestWork {
            work_kind,
            payload,
            step_id,
        } => insert_step(&mut next, work_kind, payload, step_id.as_deref(), ctx)?,
        Action::RequestApproval { payload, step_id } => {
            insert_step(&mut next, APPROVAL_KIND, payload, step_id.as_deref(), ctx)?;
        }
        Action::Annotate { key, value } => {
            next.artifacts.insert(key.clone(), value.clone());
            next.log
                .push(LogEntry::new(ctx.now, LogEvent::Annotate, json!({ "key": key })));
        }
    }
    Ok(next)
}

/// Move a `WAITING` step to `IN_PROGRESS` before it is handed to an executor.
pub fn mark_in_progress(
    state: &WorkflowState,
    step_id: &str,
    ctx: &ExecutionContext,
) -> Result<WorkflowState, TransitionError> {
    let current = state
        .step(step_id)
        .ok_or_else(|| TransitionError::UnknownStep(step_id.to_string()))?;
    if current.status != StepStatus::Waiting {
        return Err(TransitionError::IllegalStepTransition {
            step_id: step_id.to_string(),
            from: current.status,
            to: StepStatus::InProgress,
        });
    }

    let mut next = state.clone();
    if let Some(step) = next.open_steps.get_mut(step_id) {
        step.status = StepStatus::InProgress;
        step.updated_at = ctx.now;
    }
    next.log.push(LogEntry::new(
        ctx.now,
        LogEvent::StepStarted,
        json!({ "stepId": step_id }),
    ));
    Ok(next)
}

/// Record an executor result for a dispatched step.
///
/// `OK` settles the step as `DONE`, every other status as `FAILED`. Artifact
/// references are merged into the workflow artifacts and the full result is
/// appended to the log.
pub fn apply_execution_result(
    state: &WorkflowState,
    step_id: &str,
    result: &ExecutionResult,
    ctx: &ExecutionContext,
) -> Result<WorkflowState, TransitionError> {
    let current = state
        .step(step_id)
        .ok_or_else(|| TransitionError::UnknownStep(step_id.to_string()))?;
    let target = if result.is_ok() {
        StepStatus::Done
    } else {
        StepStatus::Failed
    };
    if current.status != StepStatus::InProgress {
        return Err(TransitionError::IllegalStepTransition {
            step_id: step_id.to_string(),
            from: current.status,
            to: target,
        });
    }

    let mut next = state.clone();
    if let Some(step) = next.open_steps.get_mut(step_id) {
        step.status = target;
        step.updated_at = ctx.now;
    }
    for (key, value) in &result.artifacts {
        next.artifacts.insert(key.clone(), value.clone());
    }
    next.log.push(LogEntry::new(
        ctx.now,
        LogEvent::StepResult,
        json!({
            "stepId": step_id,
            "status": target,
            "result": result,
        }),
    ));
    Ok(next)
}

/// Commit the terminal workflow status.
///
/// `FAILED` if any step failed, otherwise `COMPLETED`. Refuses while steps are
/// still `WAITING` or `IN_PROGRESS`. A terminal state is returned unchanged.
pub fn finalize(
    state: &WorkflowState,
    ctx: &ExecutionContext,
) -> Result<WorkflowState, TransitionError> {
    if state.status.is_terminal() {
        return Ok(state.clone());
    }
    let unsettled = state.unsettled_step_ids();
    if !unsettled.is_empty() {
        return Err(TransitionError::UnsettledSteps(unsettled));
    }

    let failed = state.failed_step_ids();
    let mut next = state.clone();
    next.status = if failed.is_empty() {
        WorkflowStatus::Completed
    } else {
        WorkflowStatus::Failed
    };
    next.log.push(LogEntry::new(
        ctx.now,
        LogEvent::Finalized,
        json!({
            "status": next.status,
            "failedSteps": failed,
        }),
    ));
    Ok(next)
}

fn validate_action(action: &Action) -> Result<(), TransitionError> {
    match action {
        Action::RequestWork {
            work_kind, step_id, ..
        } => {
            if work_kind.trim().is_empty() {
                return Err(TransitionError::Validation(
                    "REQUEST_WORK requires a non-empty work kind".to_string(),
                ));
            }
            validate_step_id(step_id.as_deref())
        }
        Action::RequestApproval { step_id, .. } => validate_step_id(step_id.as_deref()),
        Action::Annotate { key, .. } => {
            if key.trim().is_empty() {
                return Err(TransitionError::Validation(
                    "ANNOTATE requires a non-empty key".to_string(),
                ));
            }
            Ok(())
        }
    }
}

fn validate_step_id(step_id: Option<&str>) -> Result<(), TransitionError> {
    match step_id {
        Some(id) if id.trim().is_empty() => Err(TransitionError::Validation(
            "explicit step id must be non-empty".to_string(),
        )),
        _ => Ok(()),
    }
}

fn insert_step(
    state: &mut WorkflowState,
    kind: &str,
    payload: &Value,
    explicit_id: Option<&str>,
    ctx: &ExecutionContext,
) -> Result<(), TransitionError> {
    let step_id = match explicit_id {
        Some(id) => {
            if state.open_steps.contains_key(id) {
                return Err(TransitionError::DuplicateStep(id.to_string()));
            }
            id.to_string()
        }
        None => generate_step_id(state, kind),
    };

    state.open_steps.insert(
        step_id.clone(),
        StepState {
            kind: kind.to_string(),
            status: StepStatus::Waiting,
            payload: payload.clone(),
            requested_at: ctx.now,
            updated_at: ctx.now,
        },
    );
    state.log.push(LogEntry::new(
        ctx.now,
        LogEvent::StepRequested,
        json!({ "stepId": step_id, "kind": kind }),
    ));
    Ok(())
}

/// `<kind>-<n>` with the smallest free `n` starting after the current step count.
fn generate_step_id(state: &WorkflowState, kind: &str) -> String {
    let mut n = state.open_steps.len() + 1;
    loop {
        let candidate = format!("{kind}-{n}");
        if !state.open_steps.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
