//! Semantic invariants not expressible via JSON Schema.

use crate::core::types::WorkflowState;

/// Check semantic invariants of a workflow state:
/// - non-empty `goalId` and step kinds
/// - `updatedAt >= requestedAt` for every step
/// - log timestamps never go backwards
/// - a terminal workflow has no `WAITING` / `IN_PROGRESS` steps
pub fn validate_invariants(state: &WorkflowState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.goal_id.trim().is_empty() {
        errors.push("goalId must be non-empty".to_string());
    }

    for (id, step) in &state.open_steps {
        if id.trim().is_empty() {
            errors.push("step ids must be non-empty".to_string());
        }
        if step.kind.trim().is_empty() {
            errors.push(format!("step '{id}': kind must be non-empty"));
        }
        if step.updated_at < step.requested_at {
            errors.push(format!(
                "step '{id}': updatedAt {} precedes requestedAt {}",
                step.updated_at, step.requested_at
            ));
        }
    }

    for (index, pair) in state.log.windows(2).enumerate() {
        if pair[1].at < pair[0].at {
            errors.push(format!(
                "log entry {} at {} precedes entry {} at {}",
                index + 1,
                pair[1].at,
                index,
                pair[0].at
            ));
        }
    }

    if state.status.is_terminal() {
        let unsettled = state.unsettled_step_ids();
        if !unsettled.is_empty() {
            errors.push(format!(
                "{} workflow has unsettled steps: {}",
                state.status,
                unsettled.join(", ")
            ));
        }
    }

    errors
}
