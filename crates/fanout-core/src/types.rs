use crate::error::{FanoutError, FanoutResult, WorkerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Smallest worker count a task may request.
pub const MIN_AGENTS: usize = 1;
/// Largest worker count a task may request.
pub const MAX_AGENTS: usize = 10;

// --- Task ---

/// The immutable unit of work submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    prompt: String,
    agent_count: usize,
}

impl Task {
    /// Validate and build a task with the default `1..=10` worker range.
    pub fn new(prompt: impl Into<String>, agent_count: usize) -> FanoutResult<Self> {
        Self::with_limit(prompt, agent_count, MAX_AGENTS)
    }

    /// Validate and build a task, capping the worker count at `max_agents`.
    ///
    /// `max_agents` itself is clamped to [`MAX_AGENTS`].
    pub fn with_limit(
        prompt: impl Into<String>,
        agent_count: usize,
        max_agents: usize,
    ) -> FanoutResult<Self> {
        let prompt = prompt.into().trim().to_string();
        if prompt.is_empty() {
            return Err(FanoutError::Validation("Prompt is required".to_string()));
        }
        let max = max_agents.clamp(MIN_AGENTS, MAX_AGENTS);
        if !(MIN_AGENTS..=max).contains(&agent_count) {
            return Err(FanoutError::Validation(format!(
                "Agent count must be between {MIN_AGENTS} and {max}"
            )));
        }
        Ok(Self {
            prompt,
            agent_count,
        })
    }

    /// The prompt every worker receives.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Number of workers to fan out to.
    pub fn agent_count(&self) -> usize {
        self.agent_count
    }

    /// The prompt truncated to `max_chars` characters, for logs and stream headers.
    pub fn prompt_preview(&self, max_chars: usize) -> String {
        self.prompt.chars().take(max_chars).collect()
    }
}

// --- Worker state ---

/// Lifecycle state of one worker handle.
///
/// Transitions only move forward: `Created → Running → {Succeeded | Failed | TimedOut}`.
/// A spawn failure moves `Created` straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Handle allocated, execution not yet confirmed.
    Created,
    /// Execution started and producing output.
    Running,
    /// Execution finished with a result.
    Succeeded,
    /// Spawn failed, execution failed, or the worker was cancelled.
    Failed,
    /// A deadline elapsed and the execution was force-terminated.
    TimedOut,
}

impl WorkerState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::TimedOut => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    pub fn can_advance_to(self, next: WorkerState) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

// --- Final result ---

/// Terminal outcome of one worker.
///
/// `output` is present on success and also on failure or timeout when the
/// worker produced partial output before stopping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResult {
    /// Terminal state the worker reached.
    pub status: WorkerState,
    /// Final text, or the partial output accumulated before a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// The failure, for non-successful workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerError>,
}

impl FinalResult {
    /// A successful result.
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            status: WorkerState::Succeeded,
            output: Some(output.into()),
            error: None,
        }
    }

    /// A failed result, keeping any partial output.
    ///
    /// `TimedOut` errors produce a `TimedOut` status; every other error is `Failed`.
    pub fn from_error(error: WorkerError, partial_output: Option<String>) -> Self {
        let status = match error {
            WorkerError::TimedOut { .. } => WorkerState::TimedOut,
            _ => WorkerState::Failed,
        };
        Self {
            status,
            output: partial_output.filter(|o| !o.is_empty()),
            error: Some(error),
        }
    }

    /// Whether the worker succeeded.
    pub fn is_success(&self) -> bool {
        self.status == WorkerState::Succeeded
    }
}

// --- Output events ---

/// What an output event carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventPayload {
    /// An incremental chunk of worker output.
    Chunk(String),
    /// The worker's last event: its final result.
    Terminal(FinalResult),
}

/// One immutable output record emitted by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    /// Index of the emitting worker.
    pub worker_index: usize,
    /// Monotonic per-worker sequence number, starting at 0.
    pub sequence: u64,
    /// UTC time the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Chunk or terminal marker.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl OutputEvent {
    /// Build an event stamped with the current time.
    pub fn new(worker_index: usize, sequence: u64, payload: EventPayload) -> Self {
        Self {
            worker_index,
            sequence,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Whether this is the worker's terminal marker.
    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, EventPayload::Terminal(_))
    }
}

// --- Session ---

/// Overall state of one orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no workers launched yet.
    Pending,
    /// Workers launched, at least one not yet terminal.
    Running,
    /// Every worker succeeded.
    Completed,
    /// At least one worker succeeded and at least one did not.
    PartiallyFailed,
    /// No worker succeeded.
    Failed,
    /// Aborted by the caller before completion.
    Cancelled,
}

impl SessionState {
    /// Whether the session reached a final classification.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyFailed | Self::Failed | Self::Cancelled
        )
    }

    /// Classify a finished batch from its workers' terminal states.
    pub fn classify<I>(states: I) -> Self
    where
        I: IntoIterator<Item = WorkerState>,
    {
        let (mut succeeded, mut unsuccessful) = (0usize, 0usize);
        for state in states {
            if state == WorkerState::Succeeded {
                succeeded += 1;
            } else {
                unsuccessful += 1;
            }
        }
        match (succeeded, unsuccessful) {
            (s, 0) if s > 0 => Self::Completed,
            (0, _) => Self::Failed,
            _ => Self::PartiallyFailed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::PartiallyFailed => write!(f, "partially_failed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Point-in-time view of a single worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    /// Worker index.
    pub worker_index: usize,
    /// Substrate execution id, absent when spawn failed.
    pub execution_id: Option<String>,
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Number of events emitted so far.
    pub events: u64,
    /// Final result once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalResult>,
}

/// Point-in-time view of a session, served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Session id.
    pub session_id: Uuid,
    /// Overall state.
    pub state: SessionState,
    /// The submitted task.
    pub task: Task,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the session reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-worker views, ordered by index.
    pub workers: Vec<WorkerSnapshot>,
}

// --- Wire records ---

/// One line of the merged NDJSON stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRecord {
    /// First record of every stream.
    #[serde(rename_all = "camelCase")]
    Start {
        /// Session id, usable for reconnection.
        session_id: Uuid,
        /// Number of workers launched.
        agent_count: usize,
        /// Prompt preview.
        prompt: String,
    },
    /// A worker output event.
    Event(OutputEvent),
    /// Last record, emitted once the session is terminal.
    #[serde(rename_all = "camelCase")]
    Summary {
        /// Session id.
        session_id: Uuid,
        /// Final classification.
        state: SessionState,
        /// Per-worker results keyed by index.
        results: BTreeMap<usize, FinalResult>,
    },
}

impl StreamRecord {
    /// Whether this record ends the stream.
    pub fn is_summary(&self) -> bool {
        matches!(self, Self::Summary { .. })
    }
}

/// Body of a single-shot orchestration response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationOutcome {
    /// Session id.
    pub session_id: Uuid,
    /// Final classification.
    pub state: SessionState,
    /// Per-worker results keyed by index; always exactly N entries.
    pub results: BTreeMap<usize, FinalResult>,
}
