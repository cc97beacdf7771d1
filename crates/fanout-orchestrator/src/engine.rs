use crate::launcher::WorkerPoolLauncher;
use crate::registry::SessionRegistry;
use crate::session::OrchestrationSession;
use crate::substrate::ExecutionSubstrate;
use fanout_core::{FanoutResult, OrchestrationOutcome, OrchestratorConfig, Task};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Upper bound on how often the registry reaper runs.
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Entry point shared by the gateway and the CLI: validates tasks, runs
/// sessions through the launcher and keeps them in the registry.
pub struct Orchestrator {
    launcher: Arc<WorkerPoolLauncher>,
    registry: Arc<SessionRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Build an orchestrator over `substrate`.
    pub fn new(substrate: Arc<dyn ExecutionSubstrate>, config: OrchestratorConfig) -> Self {
        let launcher = Arc::new(WorkerPoolLauncher::from_config(substrate, &config));
        let registry = Arc::new(SessionRegistry::new(config.session_retention()));
        Self {
            launcher,
            registry,
            config,
        }
    }

    /// The shared launcher; its ceiling applies across sessions.
    pub fn launcher(&self) -> &Arc<WorkerPoolLauncher> {
        &self.launcher
    }

    /// Registered sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Engine settings.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validate a submission against the configured worker limit.
    pub fn task(&self, prompt: impl Into<String>, agent_count: usize) -> FanoutResult<Task> {
        Task::with_limit(prompt, agent_count, self.config.max_agents)
    }

    /// Whether the substrate can currently accept work.
    pub async fn ready(&self) -> FanoutResult<()> {
        self.launcher.substrate().preflight().await
    }

    /// Create, launch and register a session.
    ///
    /// Nothing is registered when the launch fails.
    pub async fn submit(&self, task: Task) -> FanoutResult<Arc<OrchestrationSession>> {
        let session = OrchestrationSession::new(task);
        session.launch(&self.launcher).await?;
        self.registry.insert(session.clone()).await;
        Ok(session)
    }

    /// Submit and wait for the outcome, bounded by the session timeout.
    pub async fn run(&self, task: Task) -> FanoutResult<OrchestrationOutcome> {
        let session = self.submit(task).await?;
        session.wait_outcome(self.config.session_timeout()).await
    }

    /// Look up a registered session.
    pub async fn session(&self, id: Uuid) -> FanoutResult<Arc<OrchestrationSession>> {
        self.registry.get(id).await
    }

    /// Cancel a registered session and return it once every worker has stopped.
    pub async fn cancel(&self, id: Uuid) -> FanoutResult<Arc<OrchestrationSession>> {
        let session = self.registry.get(id).await?;
        if session.cancel().await {
            info!(session_id = %id, "Session cancelled");
        }
        Ok(session)
    }

    /// Start the background task that reclaims expired sessions.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = self
            .config
            .session_retention()
            .clamp(Duration::from_secs(1), MAX_REAP_INTERVAL);
        self.registry.spawn_reaper(interval, shutdown)
    }
}
