//! Local process substrate: one agent CLI child process per worker.
//!
//! Each stdout line becomes an output chunk, except the agent's closing
//! `{"type":"result"}` line which carries the final result.

use super::{parse_output_line, render_template, Execution, ExecutionOutput, ExecutionSubstrate};
use async_trait::async_trait;
use fanout_core::{FanoutError, FanoutResult, ProcessSubstrateConfig, Task};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Longest stderr excerpt attached to a failure.
const STDERR_EXCERPT: usize = 2000;

struct ChildControl {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Runs each worker as a child process of the orchestrator.
pub struct ProcessSubstrate {
    config: ProcessSubstrateConfig,
    children: Arc<Mutex<HashMap<String, ChildControl>>>,
    next_id: AtomicU64,
}

impl ProcessSubstrate {
    /// Create a substrate from its configuration.
    pub fn new(config: ProcessSubstrateConfig) -> Self {
        Self {
            config,
            children: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of child processes currently tracked.
    pub async fn active_count(&self) -> usize {
        self.children.lock().await.len()
    }

    fn resolve_command(&self) -> Option<PathBuf> {
        let command = Path::new(&self.config.command);
        if command.components().count() > 1 {
            return command.is_file().then(|| command.to_path_buf());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(command))
            .find(|candidate| candidate.is_file())
    }

    fn missing_env(&self) -> Vec<String> {
        self.config
            .required_env
            .iter()
            .filter(|key| {
                let configured = self.config.env.get(*key).is_some_and(|v| !v.is_empty());
                let inherited = std::env::var(key).is_ok_and(|v| !v.is_empty());
                !configured && !inherited
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExecutionSubstrate for ProcessSubstrate {
    fn name(&self) -> &str {
        "process"
    }

    async fn preflight(&self) -> FanoutResult<()> {
        if self.resolve_command().is_none() {
            return Err(FanoutError::SubstrateUnavailable(format!(
                "agent command '{}' not found",
                self.config.command
            )));
        }
        let missing = self.missing_env();
        if !missing.is_empty() {
            return Err(FanoutError::SubstrateUnavailable(format!(
                "required environment not configured: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    async fn create(&self, task: &Task, worker_index: usize) -> FanoutResult<Execution> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(
            self.config
                .args
                .iter()
                .map(|arg| render_template(arg, task, worker_index)),
        )
        .envs(&self.config.env)
        .env("FANOUT_WORKER_INDEX", worker_index.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| FanoutError::Spawn {
            worker_index,
            message: format!("failed to run '{}': {e}", self.config.command),
        })?;

        let pid = child.id();
        let id = match pid {
            Some(pid) => format!("pid-{pid}"),
            None => format!("proc-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
        };
        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                let _ = child.start_kill();
                return Err(FanoutError::Spawn {
                    worker_index,
                    message: "child process has no stdio pipes".to_string(),
                });
            }
        };

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        self.children.lock().await.insert(
            id.clone(),
            ChildControl {
                pid,
                kill_tx: Some(kill_tx),
            },
        );
        info!(execution_id = %id, worker_index, "Agent process started");

        let (tx, rx) = mpsc::channel(64);
        let children = self.children.clone();
        let execution_id = id.clone();

        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = BufReader::new(stderr).read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            });

            let mut stdout = BufReader::new(stdout);
            let mut line = Vec::new();
            let mut terminal_sent = false;
            let mut killed = false;
            loop {
                line.clear();
                tokio::select! {
                    Ok(()) = &mut kill_rx => {
                        killed = true;
                        break;
                    }
                    read = stdout.read_until(b'\n', &mut line) => match read {
                        Ok(0) => break,
                        Ok(_) => {
                            // Agent output is not guaranteed to be UTF-8.
                            let text = String::from_utf8_lossy(&line);
                            let text = text.trim_end_matches(['\n', '\r']);
                            if text.trim().is_empty() {
                                continue;
                            }
                            let msg = parse_output_line(text);
                            let terminal = !matches!(msg, ExecutionOutput::Chunk(_));
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                            terminal_sent |= terminal;
                        }
                        Err(e) => {
                            warn!(execution_id = %execution_id, error = %e, "Failed reading agent output");
                            if !terminal_sent {
                                let error = format!("failed reading agent output: {e}");
                                let _ = tx.send(ExecutionOutput::Failed { error }).await;
                                terminal_sent = true;
                            }
                            break;
                        }
                    }
                }
            }

            let status = if killed {
                force_kill(&mut child, pid, &execution_id);
                child.wait().await
            } else {
                tokio::select! {
                    status = child.wait() => status,
                    Ok(()) = &mut kill_rx => {
                        killed = true;
                        force_kill(&mut child, pid, &execution_id);
                        child.wait().await
                    }
                }
            };

            // Descendants may still hold stderr open after a kill.
            let stderr = if killed {
                stderr_task.abort();
                String::new()
            } else {
                stderr_task.await.unwrap_or_default()
            };
            if !terminal_sent && !killed {
                let failure = match status {
                    Ok(s) if s.success() => None,
                    Ok(s) => Some(format!(
                        "agent exited with {s}: {}",
                        excerpt(&stderr, STDERR_EXCERPT)
                    )),
                    Err(e) => Some(format!("failed waiting for agent: {e}")),
                };
                if let Some(error) = failure {
                    let _ = tx.send(ExecutionOutput::Failed { error }).await;
                }
            }
            debug!(execution_id = %execution_id, killed, "Agent process reaped");
            children.lock().await.remove(&execution_id);
        });

        Ok(Execution { id, output: rx })
    }

    async fn terminate(&self, execution_id: &str) -> FanoutResult<()> {
        let pid = {
            let children = self.children.lock().await;
            match children.get(execution_id) {
                Some(control) => control.pid,
                // Already exited and reaped.
                None => return Ok(()),
            }
        };

        #[cfg(unix)]
        if let Some(pid) = pid {
            match signal_group(pid, libc::SIGINT) {
                Ok(()) => debug!(execution_id, pid, "Sent SIGINT to agent process group"),
                Err(e) => warn!(execution_id, pid, error = %e, "Failed to send SIGINT"),
            }
            return Ok(());
        }

        let _ = pid;
        self.kill(execution_id).await
    }

    async fn kill(&self, execution_id: &str) -> FanoutResult<()> {
        let mut children = self.children.lock().await;
        if let Some(tx) = children
            .get_mut(execution_id)
            .and_then(|control| control.kill_tx.take())
        {
            warn!(execution_id, "Force-killing agent process");
            let _ = tx.send(());
        }
        Ok(())
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// Children are spawned as group leaders, so this reaches every process the
/// agent started.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
    })?;
    // SAFETY: pgid names a group we created and whose leader we have not reaped.
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn force_kill(child: &mut Child, pid: Option<u32>, execution_id: &str) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        if let Err(e) = signal_group(pid, libc::SIGKILL) {
            debug!(execution_id, pid, error = %e, "Process group already gone");
        }
    }
    let _ = pid;
    if let Err(e) = child.start_kill() {
        debug!(execution_id, error = %e, "Agent process already exited");
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
