use crate::substrate::{spawn_message, Execution, ExecutionOutput, ExecutionSubstrate};
use fanout_core::{
    EventPayload, FanoutError, FanoutResult, FinalResult, OrchestratorConfig, OutputEvent, Task,
    WorkerError, WorkerSnapshot, WorkerState,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Per-worker limits applied by every handle a launcher spawns.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Hard deadline for one worker, measured from a successful spawn.
    pub timeout: Duration,
    /// How long a terminated execution gets to stop before it is killed.
    pub terminate_grace: Duration,
    /// Capacity of the per-worker event channel.
    pub event_buffer: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for WorkerSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            timeout: config.worker_timeout(),
            terminate_grace: config.terminate_grace(),
            event_buffer: config.event_buffer,
        }
    }
}

/// Observable status of a worker, published on every change.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    /// Lifecycle state.
    pub state: WorkerState,
    /// Final result, present once terminal.
    pub result: Option<FinalResult>,
    /// Events emitted so far.
    pub events: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancel,
    Deadline { after_ms: u64 },
}

impl StopReason {
    fn into_error(self) -> WorkerError {
        match self {
            Self::Cancel => WorkerError::Cancelled,
            Self::Deadline { after_ms } => WorkerError::TimedOut { after_ms },
        }
    }
}

/// One worker: a single isolated execution of the task.
///
/// A driver task owns the execution's output channel. It numbers events
/// from 0, records them in the handle's output buffer, and forwards them
/// on the event channel returned by [`take_events`](Self::take_events).
/// The terminal event always carries the last sequence number.
pub struct WorkerHandle {
    index: usize,
    execution_id: Option<String>,
    status: watch::Receiver<WorkerStatus>,
    stop: watch::Sender<Option<StopReason>>,
    events: Mutex<Option<mpsc::Receiver<OutputEvent>>>,
    buffer: Arc<RwLock<Vec<OutputEvent>>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.index)
            .field("execution_id", &self.execution_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Create and start one execution of `task` as worker `index`.
    ///
    /// Never fails: a substrate spawn error yields a handle that is already
    /// `Failed` with a [`WorkerError::Spawn`] result.
    pub async fn spawn(
        substrate: Arc<dyn ExecutionSubstrate>,
        task: &Task,
        index: usize,
        settings: WorkerSettings,
    ) -> Self {
        let execution = match substrate.create(task, index).await {
            Ok(execution) => execution,
            Err(e) => {
                let message = spawn_message(e);
                warn!(worker_index = index, error = %message, "Worker spawn failed");
                return Self::spawn_failed(index, message);
            }
        };

        let (events_tx, events_rx) = mpsc::channel(settings.event_buffer.max(1));
        let (stop_tx, stop_rx) = watch::channel(None);
        let buffer = Arc::new(RwLock::new(Vec::new()));
        let (status_tx, status_rx) = watch::channel(WorkerStatus {
            state: WorkerState::Created,
            result: None,
            events: 0,
        });

        let execution_id = execution.id.clone();
        status_tx.send_modify(|s| s.state = WorkerState::Running);
        info!(worker_index = index, execution_id = %execution_id, "Worker started");

        let emitter = Emitter {
            index,
            next_sequence: 0,
            tx: events_tx,
            buffer: buffer.clone(),
            status: status_tx,
        };
        tokio::spawn(drive(execution, substrate, settings, emitter, stop_rx));

        Self {
            index,
            execution_id: Some(execution_id),
            status: status_rx,
            stop: stop_tx,
            events: Mutex::new(Some(events_rx)),
            buffer,
        }
    }

    /// A handle that never started: `Failed` with a spawn error as its only event.
    pub(crate) fn spawn_failed(index: usize, message: impl Into<String>) -> Self {
        let result = FinalResult::from_error(WorkerError::spawn(message), None);
        let event = OutputEvent::new(index, 0, EventPayload::Terminal(result.clone()));
        let (events_tx, events_rx) = mpsc::channel(1);
        let _ = events_tx.try_send(event.clone());
        let (_, status) = watch::channel(WorkerStatus {
            state: WorkerState::Failed,
            result: Some(result),
            events: 1,
        });
        Self {
            index,
            execution_id: None,
            status,
            stop: watch::channel(None).0,
            events: Mutex::new(Some(events_rx)),
            buffer: Arc::new(RwLock::new(vec![event])),
        }
    }

    /// Worker index within its session.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Substrate execution id; `None` when spawn failed.
    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_deref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.status.borrow().state
    }

    /// Final result, once terminal.
    pub fn result(&self) -> Option<FinalResult> {
        self.status.borrow().result.clone()
    }

    /// Take the live event channel. Only the first call returns `Some`.
    ///
    /// The channel is bounded: until it is detached, a taken receiver must be
    /// drained or the worker stalls once the buffer fills.
    pub fn take_events(&self) -> Option<mpsc::Receiver<OutputEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Drop the live event channel if nobody took it.
    ///
    /// Events are still recorded in the output buffer.
    pub fn detach_events(&self) {
        drop(self.take_events());
    }

    /// Every event emitted so far, in sequence order.
    pub async fn events(&self) -> Vec<OutputEvent> {
        self.buffer.read().await.clone()
    }

    /// The text of every chunk emitted so far.
    pub async fn output(&self) -> String {
        self.buffer
            .read()
            .await
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Chunk(text) => Some(text.as_str()),
                EventPayload::Terminal(_) => None,
            })
            .collect()
    }

    /// Request early shutdown. The worker ends `Failed` with [`WorkerError::Cancelled`].
    ///
    /// No-op once terminal or after an earlier stop request.
    pub fn terminate(&self) {
        self.request_stop(StopReason::Cancel);
    }

    /// Force the worker to time out, as if its own deadline had elapsed after `after`.
    pub fn expire(&self, after: Duration) {
        let after_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        self.request_stop(StopReason::Deadline { after_ms });
    }

    fn request_stop(&self, reason: StopReason) {
        if self.state().is_terminal() {
            return;
        }
        self.stop.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Wait until the worker is terminal and return its result.
    pub async fn wait_terminal(&self) -> FinalResult {
        let mut status = self.status.clone();
        let result = status
            .wait_for(|s| s.result.is_some())
            .await
            .ok()
            .and_then(|s| s.result.clone());
        // The driver only exits after publishing a result; a missing one means it panicked.
        result.unwrap_or_else(|| {
            FinalResult::from_error(WorkerError::runtime("worker driver stopped unexpectedly"), None)
        })
    }

    /// Wait up to `timeout` for the final result.
    ///
    /// Returns [`FanoutError::TimedOut`] if the worker is still running; the
    /// worker itself is left untouched.
    pub async fn join(&self, timeout: Duration) -> FanoutResult<FinalResult> {
        tokio::time::timeout(timeout, self.wait_terminal())
            .await
            .map_err(|_| FanoutError::TimedOut {
                after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
    }

    /// Point-in-time view for status endpoints.
    pub fn snapshot(&self) -> WorkerSnapshot {
        let status = self.status.borrow();
        WorkerSnapshot {
            worker_index: self.index,
            execution_id: self.execution_id.clone(),
            state: status.state,
            events: status.events,
            result: status.result.clone(),
        }
    }
}

struct Emitter {
    index: usize,
    next_sequence: u64,
    tx: mpsc::Sender<OutputEvent>,
    buffer: Arc<RwLock<Vec<OutputEvent>>>,
    status: watch::Sender<WorkerStatus>,
}

impl Emitter {
    fn next_event(&mut self, payload: EventPayload) -> OutputEvent {
        let event = OutputEvent::new(self.index, self.next_sequence, payload);
        self.next_sequence += 1;
        event
    }

    async fn chunk(&mut self, text: String) {
        let event = self.next_event(EventPayload::Chunk(text));
        self.buffer.write().await.push(event.clone());
        let emitted = self.next_sequence;
        self.status.send_modify(|s| s.events = emitted);
        // A dropped receiver only means nobody is streaming this worker.
        let _ = self.tx.send(event).await;
    }

    /// Publish the terminal state before the terminal event, so a consumer
    /// seeing the event always observes a terminal handle.
    ///
    /// Returns `false`, emitting nothing, if the worker is already terminal.
    async fn finish(&mut self, result: FinalResult) -> bool {
        let current = self.status.borrow().state;
        if !current.can_advance_to(result.status) {
            warn!(
                worker_index = self.index,
                from = %current,
                to = %result.status,
                "Ignoring out-of-order worker transition"
            );
            return false;
        }
        let event = self.next_event(EventPayload::Terminal(result.clone()));
        self.buffer.write().await.push(event.clone());
        let emitted = self.next_sequence;
        self.status.send_modify(|s| {
            s.state = result.status;
            s.result = Some(result);
            s.events = emitted;
        });
        let _ = self.tx.send(event).await;
        true
    }
}

async fn drive(
    execution: Execution,
    substrate: Arc<dyn ExecutionSubstrate>,
    settings: WorkerSettings,
    mut emitter: Emitter,
    mut stop_rx: watch::Receiver<Option<StopReason>>,
) {
    let Execution { id, mut output } = execution;
    let index = emitter.index;
    let deadline = Instant::now() + settings.timeout;
    let timeout_ms = u64::try_from(settings.timeout.as_millis()).unwrap_or(u64::MAX);
    let mut partial = String::new();

    let stopped = loop {
        tokio::select! {
            msg = output.recv() => match msg {
                Some(ExecutionOutput::Chunk(text)) => {
                    partial.push_str(&text);
                    emitter.chunk(text).await;
                }
                Some(ExecutionOutput::Finished { result }) => {
                    emitter.finish(FinalResult::succeeded(result)).await;
                    break None;
                }
                Some(ExecutionOutput::Failed { error }) => {
                    warn!(worker_index = index, execution_id = %id, error = %error, "Worker failed");
                    let partial = std::mem::take(&mut partial);
                    let result = FinalResult::from_error(WorkerError::runtime(error), Some(partial));
                    emitter.finish(result).await;
                    break None;
                }
                // Output ended without a result message: the chunks are the result.
                None => {
                    emitter.finish(FinalResult::succeeded(std::mem::take(&mut partial))).await;
                    break None;
                }
            },
            _ = sleep_until(deadline) => {
                warn!(worker_index = index, execution_id = %id, timeout_ms, "Worker timed out");
                break Some(StopReason::Deadline { after_ms: timeout_ms });
            }
            reason = async { stop_rx.wait_for(Option::is_some).await.ok().and_then(|r| *r) } => {
                // A dropped handle abandons the worker.
                let reason = reason.unwrap_or(StopReason::Cancel);
                info!(worker_index = index, execution_id = %id, ?reason, "Worker stop requested");
                break Some(reason);
            }
        }
    };

    let Some(reason) = stopped else {
        debug!(worker_index = index, execution_id = %id, "Worker finished");
        return;
    };

    let result = FinalResult::from_error(reason.into_error(), Some(partial));
    emitter.finish(result).await;
    reclaim(&*substrate, &id, output, settings.terminate_grace, index).await;
}

/// Ask the execution to stop, then force-kill it if its output has not
/// closed within `grace`.
async fn reclaim(
    substrate: &dyn ExecutionSubstrate,
    id: &str,
    mut output: mpsc::Receiver<ExecutionOutput>,
    grace: Duration,
    index: usize,
) {
    if let Err(e) = substrate.terminate(id).await {
        warn!(worker_index = index, execution_id = %id, error = %e, "Terminate request failed");
    }
    let drained = tokio::time::timeout(grace, async {
        while output.recv().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            worker_index = index,
            execution_id = %id,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Worker did not stop within grace period, killing"
        );
        if let Err(e) = substrate.kill(id).await {
            warn!(worker_index = index, execution_id = %id, error = %e, "Kill failed");
        }
    }
}
