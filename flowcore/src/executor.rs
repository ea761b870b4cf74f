//! Work executor contract and a kind-routing adapter.
//!
//! Executors have two ways to report failure:
//!
//! - `Ok(ExecutionResult { status: FAIL, .. })` for expected failure modes
//!   (rate limits, oversized input, unsupported kinds). The engine records it
//!   and lets the policy react.
//! - `Err(..)` when the executor itself broke. The engine records a synthesized
//!   `PROVIDER_ERROR` result and then surfaces the error to the caller.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use serde_json::Value;
use tracing::warn;

use crate::core::context::ExecutionContext;
use crate::core::types::{ErrorKind, ExecutionError, ExecutionResult};

/// One dispatched step as seen by an executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    pub step_id: &'a str,
    /// Work kind to route on.
    pub kind: &'a str,
    pub payload: &'a Value,
}

/// Performs one unit of work.
///
/// Shared by reference across dispatch threads when the engine runs with
/// `max_concurrency > 1`.
pub trait WorkExecutor: Send + Sync {
    fn execute(&self, request: &ExecRequest<'_>, ctx: &ExecutionContext)
    -> Result<ExecutionResult>;
}

impl<F> WorkExecutor for F
where
    F: Fn(&ExecRequest<'_>, &ExecutionContext) -> Result<ExecutionResult> + Send + Sync,
{
    fn execute(
        &self,
        request: &ExecRequest<'_>,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        self(request, ctx)
    }
}

type Handler = Box<dyn Fn(&ExecRequest<'_>, &ExecutionContext) -> Result<ExecutionResult> + Send + Sync>;

/// Routes requests to per-kind handlers.
///
/// Unsupported kinds produce `FAIL` with `INVALID_REQUEST` instead of an error.
#[derive(Default)]
pub struct RoutingExecutor {
    handlers: BTreeMap<String, Handler>,
}

impl RoutingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler<F>(mut self, kind: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ExecRequest<'_>, &ExecutionContext) -> Result<ExecutionResult>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(kind.into(), Box::new(handler));
        self
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for RoutingExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingExecutor")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl WorkExecutor for RoutingExecutor {
    fn execute(
        &self,
        request: &ExecRequest<'_>,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        match self.handlers.get(request.kind) {
            Some(handler) => handler(request, ctx),
            None => {
                warn!(step_id = request.step_id, kind = request.kind, "unsupported work kind");
                Ok(unsupported_kind(request.kind))
            }
        }
    }
}

/// Structured `FAIL` for a kind the executor does not handle.
pub fn unsupported_kind(kind: &str) -> ExecutionResult {
    ExecutionResult::fail(ExecutionError::new(
        ErrorKind::InvalidRequest,
        format!("unsupported work kind '{kind}'"),
    ))
}
