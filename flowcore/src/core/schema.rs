//! Embedded JSON Schema for persisted workflow state.

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

use crate::core::invariants::validate_invariants;
use crate::core::types::WorkflowState;

pub const WORKFLOW_STATE_SCHEMA: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/schemas/workflow_state.v1.schema.json"));

/// Validate a raw state document against the embedded schema.
pub fn validate_state_schema(state: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(WORKFLOW_STATE_SCHEMA).context("parse embedded state schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(state) {
        let messages = compiled
            .iter_errors(state)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "workflow state schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Decode a state document: schema first, then serde, then semantic invariants.
pub fn state_from_value(value: Value) -> Result<WorkflowState> {
    validate_state_schema(&value)?;
    let state: WorkflowState =
        serde_json::from_value(value).context("decode workflow state")?;
    ensure_invariants(&state)?;
    Ok(state)
}

pub fn ensure_invariants(state: &WorkflowState) -> Result<()> {
    let errors = validate_invariants(state);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "workflow state invariants failed: {}",
        errors.join("; ")
    ))
}
