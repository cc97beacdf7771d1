//! Typed configuration loaded from `fanout.toml`.
//!
//! Every field has a serde default so a partial (or absent) file is valid.
//! A handful of environment variables override file values after parsing,
//! see [`FanoutConfig::apply_env`].

use crate::error::{FanoutError, FanoutResult};
use crate::types::{MAX_AGENTS, MIN_AGENTS};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FanoutConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Engine limits and timeouts.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Which execution substrate to use and how to reach it.
    #[serde(default)]
    pub substrate: SubstrateConfig,
    /// Gateway access control.
    #[serde(default)]
    pub security: SecurityConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Engine limits and timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on the requested worker count (at most 10).
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Maximum concurrent spawn attempts against the substrate.
    #[serde(default = "default_max_in_flight_spawns")]
    pub max_in_flight_spawns: usize,
    /// Hard per-worker execution deadline.
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// Deadline for the whole batch on the single-shot path.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Time a worker gets to stop after `terminate` before it is force-killed.
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
    /// How long a finished session stays available for reconnection.
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
    /// Capacity of each worker's event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl OrchestratorConfig {
    /// Per-worker deadline as a [`Duration`].
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    /// Single-shot session deadline as a [`Duration`].
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Terminate grace period as a [`Duration`].
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    /// Retention window as a [`Duration`].
    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            max_in_flight_spawns: default_max_in_flight_spawns(),
            worker_timeout_secs: default_worker_timeout_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            terminate_grace_secs: default_terminate_grace_secs(),
            session_retention_secs: default_session_retention_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Which substrate creates worker executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateKind {
    /// Local child processes.
    #[default]
    Process,
    /// Docker containers (requires the `docker` feature).
    Docker,
}

/// Substrate selection plus per-kind settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubstrateConfig {
    /// Selected substrate.
    #[serde(default)]
    pub kind: SubstrateKind,
    /// Settings for [`SubstrateKind::Process`].
    #[serde(default)]
    pub process: ProcessSubstrateConfig,
    /// Settings for [`SubstrateKind::Docker`].
    #[serde(default)]
    pub docker: DockerSubstrateConfig,
}

/// Settings for running each worker as a local agent CLI process.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSubstrateConfig {
    /// Executable to run.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Arguments; `{prompt}` is replaced by the task prompt and `{worker}` by the worker index.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Extra environment for every worker.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for every worker.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Environment variables that must be set (here or in the process env) for pre-flight to pass.
    #[serde(default = "default_required_env")]
    pub required_env: Vec<String>,
}

impl Default for ProcessSubstrateConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            env: HashMap::new(),
            working_dir: None,
            required_env: default_required_env(),
        }
    }
}

/// Settings for running each worker in its own container.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerSubstrateConfig {
    /// Image to run.
    #[serde(default = "default_image")]
    pub image: String,
    /// Host path bind-mounted at `/workspace`.
    #[serde(default = "default_workspace_path")]
    pub workspace_path: String,
    /// Container command; `{prompt}` and `{worker}` are substituted as for processes.
    #[serde(default = "default_container_cmd")]
    pub cmd: Vec<String>,
    /// Extra environment for every container.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Memory limit in megabytes.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// CPU core limit.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    /// Whether the container gets network access.
    #[serde(default = "default_network_enabled")]
    pub network_enabled: bool,
}

impl Default for DockerSubstrateConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            workspace_path: default_workspace_path(),
            cmd: default_container_cmd(),
            env: HashMap::new(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
            network_enabled: default_network_enabled(),
        }
    }
}

/// Gateway access control.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Accepted API keys. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Worker launches each client regains per second.
    #[serde(default = "default_launch_rate")]
    pub worker_launches_per_second: f64,
    /// Most worker launches a client can spend at once. Must cover `max_agents`.
    #[serde(default = "default_launch_burst")]
    pub worker_launch_burst: f64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_keys: vec![],
            worker_launches_per_second: default_launch_rate(),
            worker_launch_burst: default_launch_burst(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_agents() -> usize {
    MAX_AGENTS
}
fn default_max_in_flight_spawns() -> usize {
    4
}
fn default_worker_timeout_secs() -> u64 {
    300
}
fn default_session_timeout_secs() -> u64 {
    600
}
fn default_terminate_grace_secs() -> u64 {
    5
}
fn default_session_retention_secs() -> u64 {
    300
}
fn default_event_buffer() -> usize {
    64
}
fn default_agent_command() -> String {
    "claude".to_string()
}
fn default_agent_args() -> Vec<String> {
    ["-p", "{prompt}", "--output-format", "stream-json", "--verbose"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
fn default_required_env() -> Vec<String> {
    vec!["ANTHROPIC_API_KEY".to_string()]
}
fn default_image() -> String {
    "claude-mcp".to_string()
}
fn default_workspace_path() -> String {
    "/workspace".to_string()
}
fn default_container_cmd() -> Vec<String> {
    ["claude", "-p", "{prompt}", "--output-format", "stream-json", "--verbose"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
fn default_memory_limit_mb() -> u64 {
    2048
}
fn default_cpu_limit() -> f64 {
    1.0
}
fn default_network_enabled() -> bool {
    true
}
fn default_launch_rate() -> f64 {
    2.0
}
fn default_launch_burst() -> f64 {
    30.0
}

impl FanoutConfig {
    /// Parse a TOML document.
    pub fn from_toml(source: &str) -> FanoutResult<Self> {
        toml::from_str(source).map_err(|e| FanoutError::Config(e.to_string()))
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> FanoutResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(source) => Self::from_toml(&source),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(FanoutError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))),
        }
    }

    /// Apply environment overrides from the given lookup.
    ///
    /// `PORT`, `WORKSPACE_PATH`, `CLAUDE_MCP_IMAGE` override their settings;
    /// `ANTHROPIC_API_KEY` is forwarded to every worker of either substrate.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(path) = lookup("WORKSPACE_PATH") {
            self.substrate.docker.workspace_path = path.clone();
            self.substrate
                .process
                .working_dir
                .get_or_insert_with(|| PathBuf::from(path));
        }
        if let Some(image) = lookup("CLAUDE_MCP_IMAGE") {
            self.substrate.docker.image = image;
        }
        if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()) {
            self.substrate
                .process
                .env
                .insert("ANTHROPIC_API_KEY".to_string(), key.clone());
            self.substrate
                .docker
                .env
                .insert("ANTHROPIC_API_KEY".to_string(), key);
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> FanoutResult<()> {
        let o = &self.orchestrator;
        if !(MIN_AGENTS..=MAX_AGENTS).contains(&o.max_agents) {
            return Err(FanoutError::Config(format!(
                "orchestrator.max_agents must be between {MIN_AGENTS} and {MAX_AGENTS}"
            )));
        }
        let zeros = [
            ("max_in_flight_spawns", o.max_in_flight_spawns as u64),
            ("worker_timeout_secs", o.worker_timeout_secs),
            ("session_timeout_secs", o.session_timeout_secs),
            ("event_buffer", o.event_buffer as u64),
        ];
        if let Some((name, _)) = zeros.iter().find(|(_, v)| *v == 0) {
            return Err(FanoutError::Config(format!(
                "orchestrator.{name} must be greater than zero"
            )));
        }
        if self.security.worker_launches_per_second <= 0.0 {
            return Err(FanoutError::Config(
                "security.worker_launches_per_second must be positive".to_string(),
            ));
        }
        if self.security.worker_launch_burst < o.max_agents as f64 {
            return Err(FanoutError::Config(format!(
                "security.worker_launch_burst ({}) must cover max_agents ({})",
                self.security.worker_launch_burst, self.orchestrator.max_agents
            )));
        }
        Ok(())
    }
}
