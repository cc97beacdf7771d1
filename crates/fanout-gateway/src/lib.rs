//! HTTP submission gateway for the fanout orchestrator.
//!
//! Exposes single-shot and NDJSON-streaming orchestration endpoints, session
//! status, reconnection and cancellation, plus liveness and readiness probes.

/// Per-client worker launch budgets.
pub mod budget;
/// Error-to-response mapping.
pub mod error;
/// API key auth and budget charging middleware.
pub mod middleware;
/// Submission body parsing and validation.
pub mod request;
/// Router, routes and NDJSON streaming.
pub mod server;

pub use budget::LaunchBudget;
pub use error::ApiError;
pub use middleware::{AuthConfig, ClientKey};
pub use request::OrchestrateRequest;
pub use server::{AppState, GatewayServer};
