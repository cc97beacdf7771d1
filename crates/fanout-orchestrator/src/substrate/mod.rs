//! Execution substrates: the facilities that create isolated worker executions.
//!
//! The engine only needs the operations on [`ExecutionSubstrate`]. Concrete
//! isolation technology lives behind it:
//!
//! - [`ProcessSubstrate`] — one local agent CLI process per worker.
//! - `DockerSubstrate` — one container per worker (requires the `docker` feature).
//! - [`ScriptedSubstrate`] — an in-process fake with scripted per-worker behaviour.

#[cfg(feature = "docker")]
pub mod docker;
pub mod process;
pub mod scripted;

#[cfg(feature = "docker")]
pub use docker::DockerSubstrate;
pub use process::ProcessSubstrate;
pub use scripted::{ScriptedSubstrate, WorkerScript};

use async_trait::async_trait;
use fanout_core::{FanoutError, FanoutResult, Task};
use tokio::sync::mpsc;

/// One message on an execution's output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutput {
    /// Incremental output.
    Chunk(String),
    /// The execution completed with a final result.
    Finished {
        /// Final result text.
        result: String,
    },
    /// The execution failed after starting.
    Failed {
        /// Failure reason.
        error: String,
    },
}

/// A started execution: its substrate id plus its output channel.
///
/// The channel closing without a `Finished`/`Failed` message means the
/// execution ended on its own; the collected chunks are its result.
#[derive(Debug)]
pub struct Execution {
    /// Substrate-assigned identity (process id, container id, ...).
    pub id: String,
    /// Output produced by the execution.
    pub output: mpsc::Receiver<ExecutionOutput>,
}

/// The facility that creates and destroys isolated worker executions.
///
/// Shared by every session; only the launcher calls [`create`](Self::create).
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Short name for logs and readiness output.
    fn name(&self) -> &str;

    /// Check that the substrate can accept work at all.
    ///
    /// Must return [`FanoutError::SubstrateUnavailable`] when it cannot.
    async fn preflight(&self) -> FanoutResult<()>;

    /// Create and start one execution of `task` for `worker_index`.
    async fn create(&self, task: &Task, worker_index: usize) -> FanoutResult<Execution>;

    /// Ask the execution to stop. Cooperative; may return before it has stopped.
    async fn terminate(&self, execution_id: &str) -> FanoutResult<()>;

    /// Force-reclaim the execution's resources.
    async fn kill(&self, execution_id: &str) -> FanoutResult<()>;
}

/// Substitute `{prompt}` and `{worker}` placeholders in a command template.
pub fn render_template(template: &str, task: &Task, worker_index: usize) -> String {
    template
        .replace("{prompt}", task.prompt())
        .replace("{worker}", &worker_index.to_string())
}

/// Extract the message carried by a spawn failure, whatever variant the substrate used.
pub(crate) fn spawn_message(err: FanoutError) -> String {
    match err {
        FanoutError::Spawn { message, .. } => message,
        other => other.to_string(),
    }
}

/// Interpret one line of agent CLI output.
///
/// `stream-json` output ends with a `{"type":"result", ...}` line carrying the
/// final text and an `is_error` flag. Every other line is passed through as a chunk.
pub(crate) fn parse_output_line(line: &str) -> ExecutionOutput {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
        if value["type"].as_str() == Some("result") {
            let text = value["result"].as_str().unwrap_or_default().to_string();
            let is_error = value["is_error"].as_bool().unwrap_or(false)
                || value["subtype"].as_str().is_some_and(|s| s.starts_with("error"));
            return if is_error {
                ExecutionOutput::Failed { error: text }
            } else {
                ExecutionOutput::Finished { result: text }
            };
        }
    }
    ExecutionOutput::Chunk(format!("{line}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template() {
        let task = Task::new("fix the bug", 3).unwrap();
        assert_eq!(render_template("{prompt}", &task, 1), "fix the bug");
        assert_eq!(render_template("worker-{worker}", &task, 2), "worker-2");
        assert_eq!(render_template("--verbose", &task, 0), "--verbose");
    }

    #[test]
    fn test_parse_result_line() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"done"}"#;
        assert_eq!(
            parse_output_line(line),
            ExecutionOutput::Finished {
                result: "done".to_string()
            }
        );
    }

    #[test]
    fn test_parse_error_result_line() {
        let line = r#"{"type":"result","subtype":"error_max_turns","result":"too many turns"}"#;
        assert_eq!(
            parse_output_line(line),
            ExecutionOutput::Failed {
                error: "too many turns".to_string()
            }
        );
    }

    #[test]
    fn test_parse_plain_and_non_result_lines_are_chunks() {
        assert_eq!(
            parse_output_line("hello"),
            ExecutionOutput::Chunk("hello\n".to_string())
        );
        let line = r#"{"type":"assistant","message":{}}"#;
        assert!(matches!(parse_output_line(line), ExecutionOutput::Chunk(_)));
    }

    #[test]
    fn test_spawn_message_unwraps_spawn_variant() {
        let err = FanoutError::Spawn {
            worker_index: 1,
            message: "image missing".to_string(),
        };
        assert_eq!(spawn_message(err), "image missing");
        assert!(spawn_message(FanoutError::Config("x".to_string())).contains("Config error"));
    }
}
