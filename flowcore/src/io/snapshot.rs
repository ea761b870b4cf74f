//! Versioned workflow snapshots persisted through an [`ArtifactStore`].
//!
//! Layout: `workflows/<goalId>/<label>.json` holding
//! `{"schemaVersion": 1, "state": {...}}`.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::keys::clean_key;
use crate::core::schema::state_from_value;
use crate::core::types::WorkflowState;
use crate::io::store::{ArtifactLocator, ArtifactStore};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEnvelope {
    schema_version: u32,
    state: Value,
}

/// Store key for a snapshot of `goal_id` under `label`.
///
/// Both parts are cleaned like any artifact key, so they cannot add path
/// segments of their own.
pub fn snapshot_key(goal_id: &str, label: &str) -> Result<String> {
    let goal = single_segment(goal_id).with_context(|| format!("goal id '{goal_id}'"))?;
    let label = single_segment(label).with_context(|| format!("snapshot label '{label}'"))?;
    Ok(format!("workflows/{goal}/{label}.json"))
}

pub fn save_snapshot(
    store: &dyn ArtifactStore,
    state: &WorkflowState,
    label: &str,
) -> Result<ArtifactLocator> {
    let key = snapshot_key(&state.goal_id, label)?;
    let envelope = SnapshotEnvelope {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        state: serde_json::to_value(state).context("serialize workflow state")?,
    };
    let mut buf = serde_json::to_vec_pretty(&envelope).context("serialize snapshot")?;
    buf.push(b'\n');
    store
        .write(&key, &buf)
        .with_context(|| format!("write snapshot {key}"))
}

/// Load and validate a snapshot (schema version, JSON Schema, invariants).
pub fn load_snapshot(
    store: &dyn ArtifactStore,
    goal_id: &str,
    label: &str,
) -> Result<WorkflowState> {
    let key = snapshot_key(goal_id, label)?;
    let bytes = store
        .read(&key)
        .with_context(|| format!("read snapshot {key}"))?;
    let envelope: SnapshotEnvelope =
        serde_json::from_slice(&bytes).with_context(|| format!("parse snapshot {key}"))?;
    if envelope.schema_version != SNAPSHOT_SCHEMA_VERSION {
        return Err(anyhow!(
            "snapshot {key} has unsupported schemaVersion {} (expected {})",
            envelope.schema_version,
            SNAPSHOT_SCHEMA_VERSION
        ));
    }
    let state = state_from_value(envelope.state).with_context(|| format!("validate {key}"))?;
    if state.goal_id != goal_id {
        return Err(anyhow!(
            "snapshot {key} belongs to goal '{}', not '{goal_id}'",
            state.goal_id
        ));
    }
    Ok(state)
}

fn single_segment(raw: &str) -> Result<String> {
    let clean = clean_key(raw)?;
    match clean.segments() {
        [only] => Ok(only.clone()),
        _ => Err(anyhow!("must be a single path segment")),
    }
}
