//! In-process fake substrate with scripted per-worker behaviour.
//!
//! Each worker index can be given its own [`WorkerScript`]: the chunks it
//! emits, the delay between them, and how it ends. The substrate records the
//! order spawns started in, the peak number of concurrent spawns, and every
//! terminate/kill call, so tests can assert on admission control and
//! reclamation without a real container runtime.

use super::{Execution, ExecutionOutput, ExecutionSubstrate};
use async_trait::async_trait;
use fanout_core::{FanoutError, FanoutResult, Task};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// How a scripted execution ends after emitting its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// Report a final result.
    Succeed(String),
    /// Report a runtime failure.
    Fail(String),
    /// Never finish; only stops when terminated or killed.
    Hang,
    /// Close the output channel without a terminal message.
    EndSilently,
}

/// Behaviour of one scripted worker.
#[derive(Debug, Clone)]
pub struct WorkerScript {
    /// Chunks emitted in order.
    pub chunks: Vec<String>,
    /// Delay before each chunk (and before the outcome).
    pub chunk_delay: Duration,
    /// How the execution ends.
    pub outcome: ScriptOutcome,
    /// When set, `create` fails with this message.
    pub spawn_error: Option<String>,
    /// When true, `terminate` is ignored and only `kill` stops the execution.
    pub ignore_terminate: bool,
}

impl WorkerScript {
    /// A worker that succeeds with `output`.
    pub fn succeed(output: impl Into<String>) -> Self {
        Self {
            chunks: Vec::new(),
            chunk_delay: Duration::ZERO,
            outcome: ScriptOutcome::Succeed(output.into()),
            spawn_error: None,
            ignore_terminate: false,
        }
    }

    /// A worker that fails at runtime with `error`.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            outcome: ScriptOutcome::Fail(error.into()),
            ..Self::succeed("")
        }
    }

    /// A worker that never finishes on its own.
    pub fn hang() -> Self {
        Self {
            outcome: ScriptOutcome::Hang,
            ..Self::succeed("")
        }
    }

    /// A worker whose output channel closes without a terminal message.
    pub fn end_silently() -> Self {
        Self {
            outcome: ScriptOutcome::EndSilently,
            ..Self::succeed("")
        }
    }

    /// A worker whose spawn fails with `message`.
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(message.into()),
            ..Self::succeed("")
        }
    }

    /// Emit these chunks before the outcome.
    pub fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Wait this long before each chunk and before the outcome.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Ignore cooperative termination; only a kill stops this worker.
    pub fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }
}

/// A fake [`ExecutionSubstrate`] driven by [`WorkerScript`]s.
pub struct ScriptedSubstrate {
    default_script: WorkerScript,
    scripts: HashMap<usize, WorkerScript>,
    spawn_latency: Duration,
    available: AtomicBool,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    stops: Mutex<HashMap<String, (watch::Sender<bool>, bool)>>,
    spawn_order: Mutex<Vec<usize>>,
    terminated: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ScriptedSubstrate {
    /// Every worker follows `default_script` unless overridden.
    pub fn new(default_script: WorkerScript) -> Self {
        Self {
            default_script,
            scripts: HashMap::new(),
            spawn_latency: Duration::ZERO,
            available: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            stops: Mutex::new(HashMap::new()),
            spawn_order: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
        }
    }

    /// Override the script for one worker index.
    pub fn with_script(mut self, worker_index: usize, script: WorkerScript) -> Self {
        self.scripts.insert(worker_index, script);
        self
    }

    /// Make every `create` call take this long.
    pub fn with_spawn_latency(mut self, latency: Duration) -> Self {
        self.spawn_latency = latency;
        self
    }

    /// Toggle pre-flight availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Highest number of `create` calls observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Worker indices in the order their `create` calls began.
    pub fn spawn_order(&self) -> Vec<usize> {
        lock(&self.spawn_order).clone()
    }

    /// Total `create` calls so far, including failed ones.
    pub fn spawn_count(&self) -> usize {
        lock(&self.spawn_order).len()
    }

    /// Execution ids that received a cooperative terminate.
    pub fn terminated(&self) -> Vec<String> {
        lock(&self.terminated).clone()
    }

    /// Execution ids that were force-killed.
    pub fn killed(&self) -> Vec<String> {
        lock(&self.killed).clone()
    }

    fn script_for(&self, worker_index: usize) -> WorkerScript {
        self.scripts
            .get(&worker_index)
            .unwrap_or(&self.default_script)
            .clone()
    }

    fn signal_stop(&self, execution_id: &str, forced: bool) -> FanoutResult<()> {
        let stops = lock(&self.stops);
        let (tx, ignore_terminate) = stops.get(execution_id).ok_or_else(|| {
            FanoutError::Session(format!("unknown scripted execution {execution_id}"))
        })?;
        if forced || !*ignore_terminate {
            let _ = tx.send(true);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionSubstrate for ScriptedSubstrate {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn preflight(&self) -> FanoutResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FanoutError::SubstrateUnavailable(
                "scripted substrate marked unavailable".to_string(),
            ))
        }
    }

    async fn create(&self, _task: &Task, worker_index: usize) -> FanoutResult<Execution> {
        lock(&self.spawn_order).push(worker_index);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.spawn_latency.is_zero() {
            tokio::time::sleep(self.spawn_latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let script = self.script_for(worker_index);
        if let Some(message) = script.spawn_error {
            return Err(FanoutError::Spawn {
                worker_index,
                message,
            });
        }

        let id = format!(
            "scripted-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        lock(&self.stops).insert(id.clone(), (stop_tx, script.ignore_terminate));

        debug!(execution_id = %id, worker_index, "Scripted execution started");

        tokio::spawn(async move {
            for chunk in script.chunks {
                tokio::select! {
                    _ = stop_rx.wait_for(|stopped| *stopped) => return,
                    _ = tokio::time::sleep(script.chunk_delay) => {}
                }
                if tx.send(ExecutionOutput::Chunk(chunk)).await.is_err() {
                    return;
                }
            }
            tokio::select! {
                _ = stop_rx.wait_for(|stopped| *stopped) => return,
                _ = tokio::time::sleep(script.chunk_delay) => {}
            }
            let last = match script.outcome {
                ScriptOutcome::Succeed(result) => ExecutionOutput::Finished { result },
                ScriptOutcome::Fail(error) => ExecutionOutput::Failed { error },
                ScriptOutcome::Hang => {
                    let _ = stop_rx.wait_for(|stopped| *stopped).await;
                    return;
                }
                ScriptOutcome::EndSilently => return,
            };
            let _ = tx.send(last).await;
        });

        Ok(Execution { id, output: rx })
    }

    async fn terminate(&self, execution_id: &str) -> FanoutResult<()> {
        lock(&self.terminated).push(execution_id.to_string());
        self.signal_stop(execution_id, false)
    }

    async fn kill(&self, execution_id: &str) -> FanoutResult<()> {
        lock(&self.killed).push(execution_id.to_string());
        self.signal_stop(execution_id, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut execution: Execution) -> Vec<ExecutionOutput> {
        let mut out = Vec::new();
        while let Some(msg) = execution.output.recv().await {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_scripted_success_emits_chunks_then_result() {
        let substrate =
            ScriptedSubstrate::new(WorkerScript::succeed("done").with_chunks(["a", "b"]));
        let task = Task::new("prompt", 1).unwrap();
        let execution = substrate.create(&task, 0).await.unwrap();
        assert!(execution.id.starts_with("scripted-"));
        assert_eq!(
            drain(execution).await,
            vec![
                ExecutionOutput::Chunk("a".to_string()),
                ExecutionOutput::Chunk("b".to_string()),
                ExecutionOutput::Finished {
                    result: "done".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_per_worker_override() {
        let substrate = ScriptedSubstrate::new(WorkerScript::succeed("ok"))
            .with_script(1, WorkerScript::spawn_failure("no capacity"));
        let task = Task::new("prompt", 2).unwrap();
        assert!(substrate.create(&task, 0).await.is_ok());
        let err = substrate.create(&task, 1).await.unwrap_err();
        assert!(err.to_string().contains("no capacity"));
        assert_eq!(substrate.spawn_order(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_terminate_stops_hanging_worker() {
        let substrate = ScriptedSubstrate::new(WorkerScript::hang());
        let task = Task::new("prompt", 1).unwrap();
        let execution = substrate.create(&task, 0).await.unwrap();
        let id = execution.id.clone();
        substrate.terminate(&id).await.unwrap();
        let out = tokio::time::timeout(Duration::from_secs(1), drain(execution))
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(substrate.terminated(), vec![id]);
    }

    #[tokio::test]
    async fn test_ignoring_terminate_requires_kill() {
        let substrate = ScriptedSubstrate::new(WorkerScript::hang().ignoring_terminate());
        let task = Task::new("prompt", 1).unwrap();
        let mut execution = substrate.create(&task, 0).await.unwrap();
        substrate.terminate(&execution.id).await.unwrap();
        let still_open =
            tokio::time::timeout(Duration::from_millis(50), execution.output.recv()).await;
        assert!(still_open.is_err(), "terminate should have been ignored");

        substrate.kill(&execution.id).await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(1), execution.output.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_preflight() {
        let substrate = ScriptedSubstrate::new(WorkerScript::succeed("ok"));
        substrate.preflight().await.unwrap();
        substrate.set_available(false);
        let err = substrate.preflight().await.unwrap_err();
        assert!(matches!(err, FanoutError::SubstrateUnavailable(_)));
    }
}
