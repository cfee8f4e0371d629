//! `lambda-runtime-client` is a runtime interface client for a single-slot
//! serverless execution agent.
//!
//! The client long-polls a control endpoint for work, runs a user-supplied
//! handler against the delivered payload, and reports the result or failure
//! back before polling again. One process instance serves one execution slot;
//! invocations are strictly sequential.
//!
//! Core modules:
//! - [`config`]: control-endpoint address from the environment
//! - [`client`]: HTTP transport to the control endpoint
//! - [`context`]: per-invocation header and environment context
//! - [`gate`]: once-only completion reporting
//! - [`runtime`]: the fetch-invoke-complete-reschedule loop
//! - [`errors`]: error normalization (total, never raises)
//! - [`xray`]: best-effort trace documents for the tracing backend
//! - [`telemetry`]: tab-delimited / length-prefixed log emission

pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod gate;
pub mod runtime;
pub mod telemetry;
pub mod xray;

pub use client::RuntimeApiClient;
pub use context::Context;
pub use errors::{ErrorEnvelope, ErrorValue};
pub use gate::{Completion, CompletionGate};
pub use runtime::{Handler, HandlerFuture, HandlerOutcome, Runtime};

/// Wire up the loop against the configured control endpoint and serve
/// invocations until the process exits.
pub async fn run<H: Handler>(handler: H) -> anyhow::Result<()> {
    telemetry::init();

    let config = config::Config::from_env()?;
    let client = RuntimeApiClient::new(config.base_url())?;

    Runtime::new(client, handler).run().await
}
