//! `fanout` binary: serve the submission gateway or run one session locally.

use clap::{Parser, Subcommand};
use fanout_core::{FanoutConfig, SessionState, SubstrateKind};
use fanout_gateway::{AuthConfig, GatewayServer, LaunchBudget};
use fanout_orchestrator::{ExecutionSubstrate, Orchestrator, ProcessSubstrate};
use futures_util::StreamExt;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Idle time after which a client's launch budget is dropped.
const BUDGET_IDLE: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "fanout", about = "Fan one agent task out to N isolated workers")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fanout.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one task and print its merged stream as NDJSON
    Run {
        /// Number of workers
        #[arg(short = 'n', long, default_value_t = 1)]
        agents: usize,
        /// Prompt every worker receives
        prompt: String,
    },
}

fn build_substrate(config: &FanoutConfig) -> anyhow::Result<Arc<dyn ExecutionSubstrate>> {
    match config.substrate.kind {
        SubstrateKind::Process => Ok(Arc::new(ProcessSubstrate::new(
            config.substrate.process.clone(),
        ))),
        #[cfg(feature = "docker")]
        SubstrateKind::Docker => Ok(Arc::new(fanout_orchestrator::DockerSubstrate::connect(
            config.substrate.docker.clone(),
            config.orchestrator.terminate_grace(),
        )?)),
        #[cfg(not(feature = "docker"))]
        SubstrateKind::Docker => anyhow::bail!(
            "substrate.kind = \"docker\" requires building with the `docker` feature"
        ),
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    if let Ok(path) = dotenvy::dotenv() {
        info!(path = %path.display(), "Loaded .env");
    }

    let cli = Cli::parse();

    let mut config = FanoutConfig::load(&cli.config)?;
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;

    let substrate = build_substrate(&config)?;
    info!(substrate = substrate.name(), "Execution substrate ready");
    let orchestrator = Arc::new(Orchestrator::new(substrate, config.orchestrator.clone()));

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);

            if let Err(e) = orchestrator.ready().await {
                warn!(error = %e, "Substrate not ready at startup; /ready will report 503");
            }

            let budget = Arc::new(LaunchBudget::from_config(&config.security));
            let auth_config = AuthConfig::new(config.security.api_keys.clone());
            if auth_config.is_enabled() {
                info!(keys = config.security.api_keys.len(), "API key auth enabled");
            }

            let shutdown = CancellationToken::new();
            let reaper = orchestrator.spawn_reaper(shutdown.clone());
            let cleanup = tokio::spawn({
                let budget = budget.clone();
                let shutdown = shutdown.clone();
                async move {
                    let mut ticker = tokio::time::interval(BUDGET_IDLE);
                    loop {
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            _ = ticker.tick() => {
                                let clients = budget.cleanup(BUDGET_IDLE).await;
                                debug!(clients, "Pruned idle launch budgets");
                            }
                        }
                    }
                }
            });

            let app = GatewayServer::build_with_middleware(
                orchestrator,
                Some(budget),
                auth_config,
            );

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(addr = %addr, "fanout gateway listening");

            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .await?;

            shutdown.cancel();
            let _ = tokio::join!(reaper, cleanup);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { agents, prompt } => {
            let task = orchestrator.task(prompt, agents)?;
            let session = orchestrator.submit(task).await?;
            let session_timeout = config.orchestrator.session_timeout();

            let outcome = tokio::spawn({
                let session = session.clone();
                async move { session.wait_outcome(session_timeout).await }
            });

            let mut records = session.subscribe();
            let mut stdout = std::io::stdout().lock();
            let interrupted = CancellationToken::new();
            let signal = tokio::spawn(shutdown_signal(interrupted.clone()));
            loop {
                tokio::select! {
                    record = records.next() => {
                        let Some(record) = record else { break };
                        writeln!(stdout, "{}", serde_json::to_string(&record)?)?;
                        stdout.flush()?;
                    }
                    () = interrupted.cancelled(), if !session.is_cancelled() => {
                        session.cancel().await;
                    }
                }
            }
            signal.abort();

            let outcome = outcome.await??;
            info!(session_id = %outcome.session_id, state = %outcome.state, "Run finished");
            Ok(if outcome.state == SessionState::Completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from(["fanout", "run", "--agents", "3", "summarize X"]);
        match cli.command {
            Commands::Run { agents, prompt } => {
                assert_eq!(agents, 3);
                assert_eq!(prompt, "summarize X");
            }
            Commands::Serve { .. } => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from("fanout.toml"));
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::parse_from(["fanout", "-c", "alt.toml", "serve", "--port", "9000"]);
        assert!(matches!(
            cli.command,
            Commands::Serve { host: None, port: Some(9000) }
        ));
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
    }

    #[test]
    fn test_process_substrate_is_default() {
        let substrate = build_substrate(&FanoutConfig::default()).unwrap();
        assert_eq!(substrate.name(), "process");
    }

    #[cfg(not(feature = "docker"))]
    #[test]
    fn test_docker_requires_feature() {
        let mut config = FanoutConfig::default();
        config.substrate.kind = SubstrateKind::Docker;
        let err = build_substrate(&config).err().unwrap();
        assert!(err.to_string().contains("docker"));
    }
}
