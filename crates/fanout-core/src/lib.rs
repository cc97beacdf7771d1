//! Core types, error taxonomy, and configuration for the fanout orchestrator.
//!
//! This crate provides the types shared by the engine, the HTTP gateway and the CLI.
//!
//! # Main types
//!
//! - [`FanoutError`] — Batch-level error enum; [`FanoutResult`] is its `Result` alias.
//! - [`WorkerError`] — Why a single worker did not succeed (data, not an `Err`).
//! - [`Task`] — The validated prompt plus requested worker count.
//! - [`WorkerState`] / [`SessionState`] — Worker and session lifecycles.
//! - [`OutputEvent`] — One immutable, sequence-numbered output record.
//! - [`FinalResult`] — A worker's terminal outcome.
//! - [`StreamRecord`] — One line of the NDJSON merged stream.
//! - [`FanoutConfig`] — Configuration loaded from `fanout.toml`.

/// Configuration loading and validation.
pub mod config;
/// Error types.
pub mod error;
/// Domain and wire types.
pub mod types;

pub use config::{
    DockerSubstrateConfig, FanoutConfig, OrchestratorConfig, ProcessSubstrateConfig,
    SecurityConfig, ServerConfig, SubstrateConfig, SubstrateKind,
};
pub use error::{FanoutError, FanoutResult, WorkerError};
pub use types::{
    EventPayload, FinalResult, OrchestrationOutcome, OutputEvent, SessionSnapshot, SessionState,
    StreamRecord, Task, WorkerSnapshot, WorkerState, MAX_AGENTS, MIN_AGENTS,
};
