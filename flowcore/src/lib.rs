//! Deterministic orchestration core for multi-step workflows.
//!
//! A caller builds a [`registry::Registry`], resolves a decision policy and a
//! work executor from it, hands an initial state to an [`engine::Engine`] and
//! runs the loop: policy → apply actions → execute waiting steps → apply
//! results → policy, until the workflow finalizes. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state model, transitions,
//!   invariants, key cleaning). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (artifact storage, snapshots, config,
//!   clocks, secrets).
//!
//! Orchestration modules ([`engine`], [`registry`]) and the collaborator
//! contracts ([`policy`], [`executor`]) tie the two together.

pub mod core;
pub mod engine;
pub mod executor;
pub mod io;
pub mod logging;
pub mod policy;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
