//! Worker pool launcher: the only path by which workers are created.
//!
//! Spawns run concurrently but never more than `max_in_flight` at once
//! across every session sharing the launcher. Permits are claimed in index
//! order, so a queued launch always picks up the lowest waiting index.

use crate::substrate::ExecutionSubstrate;
use crate::worker::{WorkerHandle, WorkerSettings};
use fanout_core::{FanoutError, FanoutResult, OrchestratorConfig, Task};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Creates the worker handles for a task against a shared substrate.
pub struct WorkerPoolLauncher {
    substrate: Arc<dyn ExecutionSubstrate>,
    permits: Arc<Semaphore>,
    settings: WorkerSettings,
}

impl WorkerPoolLauncher {
    /// Create a launcher with an explicit spawn ceiling.
    ///
    /// A ceiling of zero is treated as one.
    pub fn new(
        substrate: Arc<dyn ExecutionSubstrate>,
        max_in_flight: usize,
        settings: WorkerSettings,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        info!(
            substrate = substrate.name(),
            max_in_flight, "Worker pool launcher created"
        );
        Self {
            substrate,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            settings,
        }
    }

    /// Create a launcher from the `[orchestrator]` configuration section.
    pub fn from_config(substrate: Arc<dyn ExecutionSubstrate>, config: &OrchestratorConfig) -> Self {
        Self::new(
            substrate,
            config.max_in_flight_spawns,
            WorkerSettings::from(config),
        )
    }

    /// The shared substrate.
    pub fn substrate(&self) -> &Arc<dyn ExecutionSubstrate> {
        &self.substrate
    }

    /// Per-worker limits given to every handle.
    pub fn settings(&self) -> WorkerSettings {
        self.settings
    }

    /// Spawn slots currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Launch `task.agent_count()` workers and return their handles ordered by index.
    ///
    /// Fails with [`FanoutError::SubstrateUnavailable`] before creating any
    /// handle if the substrate's pre-flight check fails. Individual spawn
    /// failures do not fail the launch; they come back as `Failed` handles.
    pub async fn launch(&self, task: &Task) -> FanoutResult<Vec<WorkerHandle>> {
        if let Err(e) = self.substrate.preflight().await {
            warn!(substrate = self.substrate.name(), error = %e, "Substrate pre-flight failed");
            return Err(match e {
                FanoutError::SubstrateUnavailable(_) => e,
                other => FanoutError::SubstrateUnavailable(other.to_string()),
            });
        }

        let count = task.agent_count();
        let mut spawns = Vec::with_capacity(count);
        for index in 0..count {
            let permit = self.permits.clone().acquire_owned().await.map_err(|_| {
                FanoutError::SubstrateUnavailable("launcher has been shut down".to_string())
            })?;
            debug!(worker_index = index, "Spawn slot acquired");

            let substrate = self.substrate.clone();
            let task = task.clone();
            let settings = self.settings;
            spawns.push(tokio::spawn(async move {
                let handle = WorkerHandle::spawn(substrate, &task, index, settings).await;
                drop(permit);
                handle
            }));
        }

        let mut handles = Vec::with_capacity(count);
        for (index, spawn) in spawns.into_iter().enumerate() {
            let handle = match spawn.await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(worker_index = index, error = %e, "Spawn task aborted");
                    WorkerHandle::spawn_failed(index, format!("spawn task aborted: {e}"))
                }
            };
            handles.push(handle);
        }

        let failed = handles
            .iter()
            .filter(|h| h.execution_id().is_none())
            .count();
        info!(workers = count, spawn_failures = failed, "Workers launched");
        Ok(handles)
    }

    /// Stop accepting launches. Launches waiting for a slot fail.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{ScriptedSubstrate, WorkerScript};
    use fanout_core::WorkerState;
    use std::time::Duration;

    fn launcher(substrate: Arc<ScriptedSubstrate>, max_in_flight: usize) -> WorkerPoolLauncher {
        WorkerPoolLauncher::new(substrate, max_in_flight, WorkerSettings::default())
    }

    #[tokio::test]
    async fn test_launch_returns_index_ordered_handles() {
        let substrate = Arc::new(ScriptedSubstrate::new(WorkerScript::succeed("ok")));
        let launcher = launcher(substrate.clone(), 4);
        let task = Task::new("p", 6).unwrap();
        let handles = launcher.launch(&task).await.unwrap();

        let indices: Vec<usize> = handles.iter().map(WorkerHandle::index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(substrate.spawn_count(), 6);
        assert_eq!(launcher.available_permits(), 4);
    }

    #[tokio::test]
    async fn test_ceiling_bounds_concurrent_spawns() {
        let substrate = Arc::new(
            ScriptedSubstrate::new(WorkerScript::succeed("ok"))
                .with_spawn_latency(Duration::from_millis(30)),
        );
        let launcher = launcher(substrate.clone(), 2);
        let task = Task::new("p", 7).unwrap();
        launcher.launch(&task).await.unwrap();

        assert!(substrate.peak_in_flight() <= 2);
        assert_eq!(substrate.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_spawns_start_in_index_order_when_serialised() {
        let substrate = Arc::new(
            ScriptedSubstrate::new(WorkerScript::succeed("ok"))
                .with_spawn_latency(Duration::from_millis(5)),
        );
        let launcher = launcher(substrate.clone(), 1);
        let task = Task::new("p", 5).unwrap();
        launcher.launch(&task).await.unwrap();
        assert_eq!(substrate.spawn_order(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_stop_later_workers() {
        let substrate = Arc::new(
            ScriptedSubstrate::new(WorkerScript::succeed("ok"))
                .with_script(1, WorkerScript::spawn_failure("image pull failed")),
        );
        let launcher = launcher(substrate.clone(), 4);
        let task = Task::new("p", 3).unwrap();
        let handles = launcher.launch(&task).await.unwrap();

        assert_eq!(handles.len(), 3);
        assert_eq!(handles[1].state(), WorkerState::Failed);
        assert!(handles[1].execution_id().is_none());
        assert!(handles[2].execution_id().is_some());
    }

    #[tokio::test]
    async fn test_unavailable_substrate_spawns_nothing() {
        let substrate = Arc::new(ScriptedSubstrate::new(WorkerScript::succeed("ok")));
        substrate.set_available(false);
        let launcher = launcher(substrate.clone(), 4);
        let task = Task::new("p", 3).unwrap();

        let err = launcher.launch(&task).await.unwrap_err();
        assert!(matches!(err, FanoutError::SubstrateUnavailable(_)));
        assert_eq!(substrate.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_launcher_rejects_launch() {
        let substrate = Arc::new(ScriptedSubstrate::new(WorkerScript::succeed("ok")));
        let launcher = launcher(substrate, 1);
        launcher.close();
        let task = Task::new("p", 1).unwrap();
        assert!(launcher.launch(&task).await.is_err());
    }
}
