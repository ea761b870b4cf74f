//! Test-only helpers: fixed contexts, scripted collaborators, in-memory storage.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use crate::core::context::{ContextProvider, ExecutionContext, FixedContextProvider};
use crate::core::keys::{clean_key, clean_prefix};
use crate::core::types::{Decision, ExecutionResult, WorkflowState};
use crate::engine::Engine;
use crate::executor::{ExecRequest, WorkExecutor};
use crate::io::store::{ArtifactLocator, ArtifactStore, LocalArtifactStore, StoreError};
use crate::policy::DecisionPolicy;

pub const FIXED_SEED: u64 = 7;

/// 2023-11-14T22:13:20Z.
pub fn fixed_start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

/// Replayable provider: one-second ticks from [`fixed_start`].
pub fn fixed_provider() -> FixedContextProvider {
    FixedContextProvider::new(fixed_start(), FIXED_SEED)
}

/// Context for iteration zero of [`fixed_provider`].
pub fn fixed_context() -> ExecutionContext {
    fixed_provider().context(0)
}

/// Fresh `RUNNING` state with empty maps.
pub fn initial_state(goal_id: &str) -> WorkflowState {
    WorkflowState::new(goal_id)
}

/// Engine over [`initial_state`] driven by [`fixed_provider`].
pub fn fixed_engine(goal_id: &str) -> Result<Engine> {
    Ok(Engine::new(initial_state(goal_id))?.with_context_provider(fixed_provider()))
}

/// Policy that replays queued decisions, then idles.
#[derive(Debug, Default)]
pub struct ScriptedPolicy {
    decisions: Mutex<VecDeque<Decision>>,
    calls: AtomicUsize,
}

impl ScriptedPolicy {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `decide` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DecisionPolicy for ScriptedPolicy {
    fn decide(&self, _state: &WorkflowState) -> Result<Decision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self
            .decisions
            .lock()
            .map_err(|_| anyhow!("scripted policy lock poisoned"))?;
        Ok(queue.pop_front().unwrap_or_default())
    }
}

/// One scripted executor response.
#[derive(Debug, Clone)]
pub enum Scripted {
    Return(ExecutionResult),
    /// Fail through the raised channel with this message.
    Raise(String),
}

/// Executor that replays queued responses, then returns `OK`.
///
/// Responses can also be pinned per step id, which keeps parallel tests
/// independent of dispatch order.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    queue: Mutex<VecDeque<Scripted>>,
    by_step: BTreeMap<String, Scripted>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            queue: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn always_ok() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step_id: impl Into<String>, response: Scripted) -> Self {
        self.by_step.insert(step_id.into(), response);
        self
    }

    /// Step ids executed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl WorkExecutor for ScriptedExecutor {
    fn execute(&self, request: &ExecRequest<'_>, _ctx: &ExecutionContext) -> Result<ExecutionResult> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("scripted executor lock poisoned"))?
            .push(request.step_id.to_string());

        let response = match self.by_step.get(request.step_id) {
            Some(pinned) => Some(pinned.clone()),
            None => self
                .queue
                .lock()
                .map_err(|_| anyhow!("scripted executor lock poisoned"))?
                .pop_front(),
        };
        match response {
            Some(Scripted::Return(result)) => Ok(result),
            Some(Scripted::Raise(message)) => Err(anyhow!(message)),
            None => Ok(ExecutionResult::ok()),
        }
    }
}

/// Thread-safe in-memory [`ArtifactStore`] with the same key cleaning as the
/// local store.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<ArtifactLocator, StoreError> {
        let key = clean_key(key)?.as_string();
        self.entries().insert(key.clone(), bytes.to_vec());
        Ok(ArtifactLocator {
            uri: format!("memory://{key}"),
            key,
        })
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let key = clean_key(key)?.as_string();
        self.entries()
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound(key))
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = clean_key(key)?.as_string();
        Ok(self.entries().contains_key(&key))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = clean_key(key)?.as_string();
        match self.entries().remove(&key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(key)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = clean_prefix(prefix)?;
        Ok(self
            .entries()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect())
    }
}

/// Local store rooted in a fresh temp directory. Keep the guard alive.
pub fn temp_local_store() -> Result<(tempfile::TempDir, LocalArtifactStore)> {
    let temp = tempfile::tempdir()?;
    let store = LocalArtifactStore::open(temp.path().join("artifacts"))?;
    Ok((temp, store))
}
