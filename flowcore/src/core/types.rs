//! Shared deterministic types for the workflow core.
//!
//! These types define the persisted shape of a workflow run and the contracts
//! exchanged with decision policies and work executors. They carry no I/O and
//! compare by value, so replays can be checked with `==`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::transitions::TransitionError;

/// Work kind assigned to steps created by [`Action::RequestApproval`].
pub const APPROVAL_KIND: &str = "approval";

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "RUNNING"),
            WorkflowStatus::Completed => write!(f, "COMPLETED"),
            WorkflowStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Lifecycle status of a single step.
///
/// `WAITING -> IN_PROGRESS -> DONE | FAILED`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Waiting,
    InProgress,
    Done,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Waiting => write!(f, "WAITING"),
            StepStatus::InProgress => write!(f, "IN_PROGRESS"),
            StepStatus::Done => write!(f, "DONE"),
            StepStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One unit of requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    /// Work kind the executor routes on.
    pub kind: String,
    pub status: StepStatus,
    /// Policy-defined executor input. Never interpreted by the core.
    #[serde(default)]
    pub payload: Value,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Event tag recorded in the append-only workflow log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEvent {
    StepRequested,
    StepStarted,
    StepResult,
    Annotate,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub event: LogEvent,
    #[serde(default)]
    pub data: Value,
}

impl LogEntry {
    pub fn new(at: DateTime<Utc>, event: LogEvent, data: Value) -> Self {
        Self { at, event, data }
    }
}

/// Single source of truth for one workflow run.
///
/// Step and artifact maps are ordered so serialized snapshots are byte-stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub goal_id: String,
    pub status: WorkflowStatus,
    pub open_steps: BTreeMap<String, StepState>,
    pub artifacts: BTreeMap<String, Value>,
    pub log: Vec<LogEntry>,
}

impl WorkflowState {
    /// Fresh `RUNNING` state with no steps, artifacts or log entries.
    pub fn new(goal_id: impl Into<String>) -> Self {
        Self {
            goal_id: goal_id.into(),
            status: WorkflowStatus::Running,
            open_steps: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.open_steps.get(step_id)
    }

    /// Steps currently in `status`, in step-id order.
    pub fn steps_with_status(
        &self,
        status: StepStatus,
    ) -> impl Iterator<Item = (&str, &StepState)> {
        self.open_steps
            .iter()
            .filter(move |(_, step)| step.status == status)
            .map(|(id, step)| (id.as_str(), step))
    }

    /// Ids of steps that have not reached `DONE` or `FAILED`.
    pub fn unsettled_step_ids(&self) -> Vec<String> {
        self.open_steps
            .iter()
            .filter(|(_, step)| !step.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn failed_step_ids(&self) -> Vec<String> {
        self.steps_with_status(StepStatus::Failed)
            .map(|(id, _)| id.to_string())
            .collect()
    }
}

/// Instruction emitted by a decision policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    #[serde(rename_all = "camelCase")]
    RequestWork {
        work_kind: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RequestApproval {
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
    },
    Annotate { key: String, value: Value },
}

/// Wire tags accepted for [`Action`], in declaration order.
pub const ACTION_TAGS: [&str; 3] = ["REQUEST_WORK", "REQUEST_APPROVAL", "ANNOTATE"];

impl Action {
    pub fn request_work(work_kind: impl Into<String>, payload: Value) -> Self {
        Action::RequestWork {
            work_kind: work_kind.into(),
            payload,
            step_id: None,
        }
    }

    pub fn request_work_as(
        step_id: impl Into<String>,
        work_kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Action::RequestWork {
            work_kind: work_kind.into(),
            payload,
            step_id: Some(step_id.into()),
        }
    }

    pub fn request_approval(payload: Value) -> Self {
        Action::RequestApproval {
            payload,
            step_id: None,
        }
    }

    pub fn annotate(key: impl Into<String>, value: Value) -> Self {
        Action::Annotate {
            key: key.into(),
            value,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Action::RequestWork { .. } => ACTION_TAGS[0],
            Action::RequestApproval { .. } => ACTION_TAGS[1],
            Action::Annotate { .. } => ACTION_TAGS[2],
        }
    }
}

/// Output of one policy invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Stop the loop after applying `actions`.
    #[serde(default)]
    pub finalize: bool,
}

impl Decision {
    /// Decision that requests nothing and keeps the run going.
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn continue_with(actions: Vec<Action>) -> Self {
        Self {
            actions,
            finalize: false,
        }
    }

    pub fn finalize_with(actions: Vec<Action>) -> Self {
        Self {
            actions,
            finalize: true,
        }
    }

    /// Decode a decision produced outside the type system (e.g. model output).
    ///
    /// Unknown or missing action tags are reported as validation errors rather
    /// than generic decode failures.
    pub fn from_value(value: Value) -> Result<Self, TransitionError> {
        if let Some(actions) = value.get("actions").and_then(Value::as_array) {
            for (index, action) in actions.iter().enumerate() {
                match action.get("type").and_then(Value::as_str) {
                    Some(tag) if ACTION_TAGS.contains(&tag) => {}
                    Some(tag) => {
                        return Err(TransitionError::Validation(format!(
                            "unknown action tag '{tag}' at index {index}"
                        )));
                    }
                    None => {
                        return Err(TransitionError::Validation(format!(
                            "action at index {index} has no type tag"
                        )));
                    }
                }
            }
        }
        serde_json::from_value(value)
            .map_err(|err| TransitionError::Validation(format!("malformed decision: {err}")))
    }
}

/// Outcome class reported by an executor for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Ok,
    Partial,
    Fail,
    RateLimited,
    ContextExceeded,
}

/// Fixed error taxonomy shared by executors and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RateLimit,
    ContextExceeded,
    InvalidRequest,
    ProviderError,
    ValidationError,
    Timeout,
}

impl ErrorKind {
    /// Retryability assumed when an executor does not say otherwise.
    pub fn default_retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimit)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::ContextExceeded => "CONTEXT_EXCEEDED",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::ProviderError => "PROVIDER_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    /// Back-off hint for `RATE_LIMIT` errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            retry_after_ms: None,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_retry_after_ms(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

/// What an executor returns for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// Artifact references merged into the workflow's artifacts on application.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ExecutionError>,
}

impl ExecutionResult {
    pub fn ok() -> Self {
        Self::with_status(ResultStatus::Ok)
    }

    pub fn ok_with(content: Value) -> Self {
        Self::ok().with_content(content)
    }

    /// `FAIL` carrying a single structured error.
    pub fn fail(error: ExecutionError) -> Self {
        Self::with_status(ResultStatus::Fail).with_error(error)
    }

    /// Map a taxonomy error onto the closest result status.
    pub fn from_error(error: ExecutionError) -> Self {
        let status = match error.kind {
            ErrorKind::RateLimit => ResultStatus::RateLimited,
            ErrorKind::ContextExceeded => ResultStatus::ContextExceeded,
            _ => ResultStatus::Fail,
        };
        Self::with_status(status).with_error(error)
    }

    pub fn with_status(status: ResultStatus) -> Self {
        Self {
            status,
            content: None,
            artifacts: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_artifact(mut self, key: impl Into<String>, value: Value) -> Self {
        self.artifacts.insert(key.into(), value);
        self
    }

    pub fn with_error(mut self, error: ExecutionError) -> Self {
        self.errors.push(error);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_serializes_with_camel_case_fields() {
        let state = WorkflowState::new("g1");
        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(
            value,
            json!({
                "goalId": "g1",
                "status": "RUNNING",
                "openSteps": {},
                "artifacts": {},
                "log": []
            })
        );
    }

    #[test]
    fn actions_use_screaming_tags_and_camel_case_fields() {
        let action = Action::request_work_as("s1", "greet", json!({"name": "ada"}));
        let value = serde_json::to_value(&action).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "REQUEST_WORK",
                "workKind": "greet",
                "payload": {"name": "ada"},
                "stepId": "s1"
            })
        );
        assert_eq!(action.tag(), "REQUEST_WORK");
    }

    #[test]
    fn decision_from_value_accepts_known_tags() {
        let decision = Decision::from_value(json!({
            "actions": [
                {"type": "REQUEST_WORK", "workKind": "greet"},
                {"type": "ANNOTATE", "key": "k", "value": 1}
            ],
            "finalize": false
        }))
        .expect("decode");

        assert_eq!(decision.actions.len(), 2);
        assert_eq!(decision.actions[0], Action::request_work("greet", Value::Null));
        assert!(!decision.finalize);
    }

    #[test]
    fn decision_from_value_rejects_unknown_tag() {
        let err = Decision::from_value(json!({
            "actions": [{"type": "DELETE_EVERYTHING"}]
        }))
        .unwrap_err();

        assert!(matches!(err, TransitionError::Validation(_)));
        assert!(err.to_string().contains("DELETE_EVERYTHING"));
    }

    #[test]
    fn decision_from_value_rejects_untagged_action() {
        let err = Decision::from_value(json!({"actions": [{"key": "k"}]})).unwrap_err();
        assert!(err.to_string().contains("no type tag"));
    }

    #[test]
    fn decision_from_value_rejects_malformed_fields() {
        let err = Decision::from_value(json!({
            "actions": [{"type": "ANNOTATE", "value": 1}]
        }))
        .unwrap_err();
        assert!(matches!(err, TransitionError::Validation(_)));
        assert!(err.to_string().contains("malformed decision"));
    }

    #[test]
    fn from_error_maps_taxonomy_onto_status() {
        let limited = ExecutionResult::from_error(
            ExecutionError::new(ErrorKind::RateLimit, "slow down").with_retry_after_ms(500),
        );
        assert_eq!(limited.status, ResultStatus::RateLimited);
        assert!(limited.errors[0].retryable);
        assert_eq!(limited.errors[0].retry_after_ms, Some(500));

        let invalid =
            ExecutionResult::from_error(ExecutionError::new(ErrorKind::InvalidRequest, "bad"));
        assert_eq!(invalid.status, ResultStatus::Fail);
        assert!(!invalid.errors[0].retryable);
    }

    #[test]
    fn error_kind_display_matches_wire_names() {
        for kind in [
            ErrorKind::RateLimit,
            ErrorKind::ContextExceeded,
            ErrorKind::InvalidRequest,
            ErrorKind::ProviderError,
            ErrorKind::ValidationError,
            ErrorKind::Timeout,
        ] {
            let wire = serde_json::to_value(kind).expect("serialize");
            assert_eq!(wire, Value::String(kind.to_string()));
        }
    }
}
