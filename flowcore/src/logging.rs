//! Diagnostic tracing for embedding applications.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Never read back and never affects workflow state.
//!
//! - **Workflow log (`WorkflowState::log`)**: the replayable audit trail.
//!   Always written by transitions, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
/// Panics if a global subscriber is already set; use [`try_init`] when that
/// may happen (tests, embedding hosts).
///
/// # Example
/// ```bash
/// RUST_LOG=flowcore=debug my-app
/// ```
pub fn init() {
    subscriber().init();
}

/// Like [`init`], but reports an already-installed subscriber instead of panicking.
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    subscriber().try_init()
}

fn subscriber() -> impl SubscriberInitExt {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
}
