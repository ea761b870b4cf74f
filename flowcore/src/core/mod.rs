//! Deterministic, pure logic shared by the orchestration core.
//!
//! Core modules must be free of I/O side effects. Time and randomness enter
//! only through [`context::ExecutionContext`], so every transition returns the
//! same output for the same inputs.

pub mod budget;
pub mod context;
pub mod invariants;
pub mod keys;
pub mod schema;
pub mod transitions;
pub mod types;
