//! Decision policy contract.
//!
//! A policy looks at the current [`WorkflowState`] and says what happens next.
//! It receives no clock or RNG; anything time-dependent must already be
//! recorded in the state (log timestamps, step results). Concrete policies
//! live outside this crate and are resolved by name through the registry.

use anyhow::Result;

use crate::core::types::{Decision, WorkflowState};

pub trait DecisionPolicy {
    /// Next batch of actions for `state`.
    ///
    /// Must be a pure function of `state` and must terminate. An `Err` halts
    /// the run loop with [`crate::engine::EngineError::Policy`].
    fn decide(&self, state: &WorkflowState) -> Result<Decision>;
}

impl<F> DecisionPolicy for F
where
    F: Fn(&WorkflowState) -> Result<Decision>,
{
    fn decide(&self, state: &WorkflowState) -> Result<Decision> {
        self(state)
    }
}
