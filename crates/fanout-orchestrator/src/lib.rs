//! Worker fan-out engine: runs one task across N isolated agent workers.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Validates tasks, runs sessions and keeps them in the registry.
//! - [`ExecutionSubstrate`] — Creates and destroys isolated worker executions.
//! - [`WorkerHandle`] — One worker's lifecycle, output buffer and final result.
//! - [`WorkerPoolLauncher`] — Spawns a task's workers under a concurrency ceiling.
//! - [`ResultAggregator`] — Merges worker output or collects final results.
//! - [`OrchestrationSession`] — State machine over one task's workers.
//! - [`SessionRegistry`] — Retains sessions for status queries and stream reconnection.

/// Result aggregation: merged event stream and final result collection.
pub mod aggregator;
/// Top-level orchestrator shared by the gateway and CLI.
pub mod engine;
/// Index-ordered, ceiling-bounded worker launches.
pub mod launcher;
/// Session retention and reaping.
pub mod registry;
/// Orchestration session state machine.
pub mod session;
/// Execution substrates.
pub mod substrate;
/// Worker handles.
pub mod worker;

pub use aggregator::{MergedEvents, ResultAggregator};
pub use engine::Orchestrator;
pub use launcher::WorkerPoolLauncher;
pub use registry::SessionRegistry;
pub use session::OrchestrationSession;
#[cfg(feature = "docker")]
pub use substrate::DockerSubstrate;
pub use substrate::{
    Execution, ExecutionOutput, ExecutionSubstrate, ProcessSubstrate, ScriptedSubstrate,
    WorkerScript,
};
pub use worker::{WorkerHandle, WorkerSettings, WorkerStatus};
