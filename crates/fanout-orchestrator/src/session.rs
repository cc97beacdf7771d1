//! Orchestration sessions: one submitted task and its workers.
//!
//! ```text
//! Pending ──launch──▶ Running ──all workers terminal──▶ Completed | PartiallyFailed | Failed
//!    │                   │
//!    └─────cancel────────┴──────────────────────────────▶ Cancelled
//! ```
//!
//! A pump task owns the merged event stream. It appends every record to a
//! replay log and decides the final classification only once every worker
//! is terminal.

use crate::aggregator::{MergedEvents, ResultAggregator};
use crate::launcher::WorkerPoolLauncher;
use crate::worker::WorkerHandle;
use chrono::{DateTime, Utc};
use fanout_core::{
    FanoutError, FanoutResult, FinalResult, OrchestrationOutcome, SessionSnapshot, SessionState,
    StreamRecord, Task, WorkerError,
};
use futures_util::future::join_all;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Longest prompt excerpt carried in the stream's start record.
const PROMPT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy)]
struct Phase {
    state: SessionState,
    completed_at: Option<DateTime<Utc>>,
}

/// One orchestration of a task across its workers.
pub struct OrchestrationSession {
    id: Uuid,
    task: Task,
    created_at: DateTime<Utc>,
    phase: watch::Sender<Phase>,
    handles: OnceLock<Vec<WorkerHandle>>,
    results: OnceLock<BTreeMap<usize, FinalResult>>,
    records: RwLock<Vec<StreamRecord>>,
    appended: watch::Sender<usize>,
    cancel: CancellationToken,
    launching: AtomicBool,
    finalized: AtomicBool,
}

impl fmt::Debug for OrchestrationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("agents", &self.task.agent_count())
            .field("workers", &self.handles())
            .finish_non_exhaustive()
    }
}

impl OrchestrationSession {
    /// Create a `Pending` session for `task`.
    pub fn new(task: Task) -> Arc<Self> {
        let id = Uuid::new_v4();
        info!(session_id = %id, agents = task.agent_count(), "Session created");
        Arc::new(Self {
            id,
            task,
            created_at: Utc::now(),
            phase: watch::channel(Phase {
                state: SessionState::Pending,
                completed_at: None,
            })
            .0,
            handles: OnceLock::new(),
            results: OnceLock::new(),
            records: RwLock::new(Vec::new()),
            appended: watch::channel(0).0,
            cancel: CancellationToken::new(),
            launching: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        })
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The submitted task.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.phase.borrow().state
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time the session became terminal.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.phase.borrow().completed_at
    }

    /// Worker handles, ordered by index. Empty until launched.
    pub fn handles(&self) -> &[WorkerHandle] {
        self.handles.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Launch the workers and start merging their output.
    ///
    /// A failed substrate pre-flight leaves the session `Failed` with no
    /// workers and returns the error.
    pub async fn launch(self: &Arc<Self>, launcher: &WorkerPoolLauncher) -> FanoutResult<()> {
        // Launch and cancel both claim this flag; whoever loses defers to the other.
        if self
            .launching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if self.cancel.is_cancelled() {
                return Err(FanoutError::Cancelled);
            }
            return Err(FanoutError::Session(format!(
                "session {} was already launched",
                self.id
            )));
        }
        if self.cancel.is_cancelled() {
            self.finalize(SessionState::Cancelled, self.cancelled_results())
                .await;
            return Err(FanoutError::Cancelled);
        }

        let handles = match launcher.launch(&self.task).await {
            Ok(handles) => handles,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Session launch failed");
                if !self.finalized.swap(true, Ordering::SeqCst) {
                    self.advance(SessionState::Failed);
                }
                // Wake subscribers so they observe the terminal state.
                self.appended.send_modify(|_| ());
                return Err(e);
            }
        };

        let merged = ResultAggregator::merge(&handles);
        if self.handles.set(handles).is_err() {
            return Err(FanoutError::Session(format!(
                "session {} was already launched",
                self.id
            )));
        }
        self.advance(SessionState::Running);
        self.append(StreamRecord::Start {
            session_id: self.id,
            agent_count: self.task.agent_count(),
            prompt: self.task.prompt_preview(PROMPT_PREVIEW_CHARS),
        })
        .await;
        info!(session_id = %self.id, agents = self.task.agent_count(), "Session running");

        tokio::spawn(self.clone().pump(merged));
        Ok(())
    }

    /// Move the session to `next` if that is a forward transition.
    ///
    /// Every state change goes through here, so a terminal session never changes again.
    fn advance(&self, next: SessionState) -> bool {
        self.phase.send_if_modified(|phase| {
            let allowed = match phase.state {
                SessionState::Pending => next != SessionState::Pending,
                SessionState::Running => next.is_terminal(),
                _ => false,
            };
            if allowed {
                phase.state = next;
                if next.is_terminal() {
                    phase.completed_at = Some(Utc::now());
                }
            }
            allowed
        })
    }

    fn cancelled_results(&self) -> BTreeMap<usize, FinalResult> {
        (0..self.task.agent_count())
            .map(|i| (i, FinalResult::from_error(WorkerError::Cancelled, None)))
            .collect()
    }

    async fn pump(self: Arc<Self>, mut merged: MergedEvents) {
        let mut propagated = false;
        loop {
            tokio::select! {
                event = merged.next() => match event {
                    Some(event) => self.append(StreamRecord::Event(event)).await,
                    None => break,
                },
                () = self.cancel.cancelled(), if !propagated => {
                    propagated = true;
                    for handle in self.handles() {
                        handle.terminate();
                    }
                }
            }
        }

        let results: BTreeMap<usize, FinalResult> = self
            .handles()
            .iter()
            .map(WorkerHandle::index)
            .zip(join_all(self.handles().iter().map(|h| h.wait_terminal())).await)
            .collect();
        let state = if self.cancel.is_cancelled() {
            SessionState::Cancelled
        } else {
            SessionState::classify(results.values().map(|r| r.status))
        };
        self.finalize(state, results).await;
    }

    async fn finalize(&self, state: SessionState, results: BTreeMap<usize, FinalResult>) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.results.set(results.clone());
        self.append(StreamRecord::Summary {
            session_id: self.id,
            state,
            results,
        })
        .await;
        self.advance(state);
        info!(session_id = %self.id, %state, "Session finished");
    }

    async fn append(&self, record: StreamRecord) {
        let len = {
            let mut records = self.records.write().await;
            records.push(record);
            records.len()
        };
        self.appended.send_replace(len);
    }

    async fn record_at(&self, position: usize) -> Option<StreamRecord> {
        self.records.read().await.get(position).cloned()
    }

    /// Cancel the session and wait until every worker is terminal.
    ///
    /// Idempotent. Returns `false` if the session was already terminal or
    /// already cancelled.
    pub async fn cancel(&self) -> bool {
        if self.state().is_terminal() || self.cancel.is_cancelled() {
            self.wait_terminal().await;
            return false;
        }
        warn!(session_id = %self.id, "Session cancellation requested");
        self.cancel.cancel();

        // Never launched: nothing will run, so finalize here.
        if self
            .launching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.finalize(SessionState::Cancelled, self.cancelled_results())
                .await;
        }
        self.wait_terminal().await;
        true
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the session is terminal.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut phase = self.phase.subscribe();
        let state = phase
            .wait_for(|p| p.state.is_terminal())
            .await
            .map(|p| p.state);
        state.unwrap_or_else(|_| self.state())
    }

    /// Run the single-shot path: wait for every worker up to `timeout`,
    /// expiring stragglers, then return the final outcome.
    pub async fn wait_outcome(&self, timeout: Duration) -> FanoutResult<OrchestrationOutcome> {
        if self.state() == SessionState::Pending && !self.launching.load(Ordering::SeqCst) {
            return Err(FanoutError::Session(format!(
                "session {} was never launched",
                self.id
            )));
        }
        ResultAggregator::collect(self.handles(), timeout).await;
        self.wait_terminal().await;
        self.outcome().ok_or_else(|| {
            FanoutError::Session(format!("session {} finished without results", self.id))
        })
    }

    /// The final outcome, once terminal.
    pub fn outcome(&self) -> Option<OrchestrationOutcome> {
        let results = self.results.get()?.clone();
        Some(OrchestrationOutcome {
            session_id: self.id,
            state: self.state(),
            results,
        })
    }

    /// Every stream record so far, followed by live records, ending with the summary.
    ///
    /// Any number of subscribers may attach at any time; each sees the full history.
    pub fn subscribe(self: &Arc<Self>) -> BoxStream<'static, StreamRecord> {
        let appended = self.appended.subscribe();
        stream::unfold(
            (self.clone(), appended, 0usize, false),
            |(session, mut appended, position, done)| async move {
                if done {
                    return None;
                }
                loop {
                    // The summary is appended before the state turns terminal.
                    let terminal = session.state().is_terminal();
                    if let Some(record) = session.record_at(position).await {
                        let done = record.is_summary();
                        return Some((record, (session, appended, position + 1, done)));
                    }
                    if terminal || appended.changed().await.is_err() {
                        return None;
                    }
                }
            },
        )
        .boxed()
    }

    /// Point-in-time view of the session and its workers.
    pub fn snapshot(&self) -> SessionSnapshot {
        let phase = *self.phase.borrow();
        SessionSnapshot {
            session_id: self.id,
            state: phase.state,
            task: self.task.clone(),
            created_at: self.created_at,
            completed_at: phase.completed_at,
            workers: self.handles().iter().map(WorkerHandle::snapshot).collect(),
        }
    }
}
