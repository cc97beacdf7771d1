//! Container substrate: one Docker container per worker.
//!
//! Requires the `docker` feature. The host workspace is bind-mounted at
//! `/workspace`, the container's stdout is parsed line by line exactly like a
//! local agent process, and the container is force-removed once it exits.

use super::{parse_output_line, render_template, Execution, ExecutionOutput, ExecutionSubstrate};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use fanout_core::{DockerSubstrateConfig, FanoutError, FanoutResult, Task};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Environment forwarded from the host into every container when set.
const FORWARDED_ENV: &[&str] = &["ANTHROPIC_API_KEY"];

/// Runs each worker in its own container.
pub struct DockerSubstrate {
    config: DockerSubstrateConfig,
    client: Docker,
    stop_grace: Duration,
}

impl DockerSubstrate {
    /// Connect to the local Docker daemon.
    ///
    /// `stop_grace` is how long a container gets to exit after a stop request.
    pub fn connect(config: DockerSubstrateConfig, stop_grace: Duration) -> FanoutResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(|e| {
            FanoutError::SubstrateUnavailable(format!("Failed to connect to Docker daemon: {e}"))
        })?;
        Ok(Self {
            config,
            client,
            stop_grace,
        })
    }

    fn container_env(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for key in FORWARDED_ENV {
            if self.config.env.contains_key(*key) {
                continue;
            }
            if let Ok(value) = std::env::var(key) {
                env.push(format!("{key}={value}"));
            }
        }
        env
    }

    fn container_config(&self, task: &Task, worker_index: usize) -> ContainerConfig<String> {
        let memory_bytes =
            i64::try_from(self.config.memory_limit_mb * 1024 * 1024).unwrap_or(i64::MAX);
        // period = 100_000us, quota = period * cores
        #[allow(clippy::cast_possible_truncation)]
        let cpu_quota = (100_000.0 * self.config.cpu_limit) as i64;

        let host_config = bollard::models::HostConfig {
            binds: Some(vec![format!("{}:/workspace", self.config.workspace_path)]),
            memory: Some(memory_bytes),
            cpu_quota: Some(cpu_quota),
            cpu_period: Some(100_000),
            network_mode: if self.config.network_enabled {
                None
            } else {
                Some("none".to_string())
            },
            ..Default::default()
        };

        let mut env = self.container_env();
        env.push(format!("FANOUT_WORKER_INDEX={worker_index}"));

        ContainerConfig {
            image: Some(self.config.image.clone()),
            working_dir: Some("/workspace".to_string()),
            cmd: Some(
                self.config
                    .cmd
                    .iter()
                    .map(|arg| render_template(arg, task, worker_index))
                    .collect(),
            ),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ExecutionSubstrate for DockerSubstrate {
    fn name(&self) -> &str {
        "docker"
    }

    async fn preflight(&self) -> FanoutResult<()> {
        self.client.ping().await.map_err(|e| {
            FanoutError::SubstrateUnavailable(format!("Docker daemon ping failed: {e}"))
        })?;
        Ok(())
    }

    async fn create(&self, task: &Task, worker_index: usize) -> FanoutResult<Execution> {
        let spawn_err = |message: String| FanoutError::Spawn {
            worker_index,
            message,
        };

        let container = self
            .client
            .create_container(
                None::<CreateContainerOptions<String>>,
                self.container_config(task, worker_index),
            )
            .await
            .map_err(|e| spawn_err(format!("Failed to create container: {e}")))?;
        let id = container.id;

        if let Err(e) = self
            .client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.kill(&id).await;
            return Err(spawn_err(format!("Failed to start container: {e}")));
        }
        info!(container_id = %id, worker_index, image = %self.config.image, "Worker container started");

        let (tx, rx) = mpsc::channel(64);
        let docker = self.client.clone();
        let container_id = id.clone();

        tokio::spawn(async move {
            let mut logs = Box::pin(docker.logs(
                &container_id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            ));

            let mut pending = String::new();
            let mut stderr = String::new();
            let mut terminal_sent = false;
            let mut receiver_gone = false;

            while let Some(item) = logs.next().await {
                match item {
                    Ok(LogOutput::StdOut { message }) => {
                        pending.push_str(&String::from_utf8_lossy(&message));
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            let line = line.trim_end();
                            if line.is_empty() {
                                continue;
                            }
                            let msg = parse_output_line(line);
                            let terminal = !matches!(msg, ExecutionOutput::Chunk(_));
                            if tx.send(msg).await.is_err() {
                                receiver_gone = true;
                                break;
                            }
                            terminal_sent |= terminal;
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container_id = %container_id, error = %e, "Error reading container logs");
                        break;
                    }
                }
                if receiver_gone {
                    break;
                }
            }

            if !receiver_gone && !pending.trim().is_empty() {
                let msg = parse_output_line(pending.trim_end());
                terminal_sent |= !matches!(msg, ExecutionOutput::Chunk(_));
                let _ = tx.send(msg).await;
            }

            let mut wait = Box::pin(
                docker.wait_container(&container_id, None::<WaitContainerOptions<String>>),
            );
            let exit_code = match wait.next().await {
                Some(Ok(response)) => response.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => {
                    debug!(container_id = %container_id, error = %e, "Container wait failed");
                    -1
                }
                None => -1,
            };

            if !terminal_sent && !receiver_gone && exit_code != 0 {
                let error = format!(
                    "container exited with code {exit_code}: {}",
                    stderr.trim()
                );
                let _ = tx.send(ExecutionOutput::Failed { error }).await;
            }

            let _ = docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            debug!(container_id = %container_id, exit_code, "Worker container removed");
        });

        Ok(Execution { id, output: rx })
    }

    async fn terminate(&self, execution_id: &str) -> FanoutResult<()> {
        let docker = self.client.clone();
        let id = execution_id.to_string();
        #[allow(clippy::cast_possible_wrap)]
        let t = self.stop_grace.as_secs() as i64;
        // Stopping blocks for up to `t` seconds; the caller enforces its own grace period.
        tokio::spawn(async move {
            if let Err(e) = docker
                .stop_container(&id, Some(StopContainerOptions { t }))
                .await
            {
                debug!(container_id = %id, error = %e, "Container stop failed");
            }
        });
        Ok(())
    }

    async fn kill(&self, execution_id: &str) -> FanoutResult<()> {
        warn!(container_id = %execution_id, "Force-removing worker container");
        // A container that already exited has been removed by its reader task.
        if let Err(e) = self
            .client
            .remove_container(
                execution_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(container_id = %execution_id, error = %e, "Container removal failed");
        }
        Ok(())
    }
}
