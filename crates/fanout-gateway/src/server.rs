use crate::budget::LaunchBudget;
use crate::error::ApiError;
use crate::middleware::{auth_middleware, budget_middleware, AuthConfig, ClientKey, MiddlewareState};
use crate::request::OrchestrateRequest;
use axum::{
    body::{Body, Bytes},
    extract::{Extension, Path, State},
    http::{header, HeaderName, StatusCode},
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fanout_core::{FanoutResult, OrchestrationOutcome, SessionSnapshot, Task};
use fanout_orchestrator::{OrchestrationSession, Orchestrator};
use futures_util::{future, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    /// The engine every route submits to.
    pub orchestrator: Arc<Orchestrator>,
    /// Launch budgets submissions are charged against, when enabled.
    pub budget: Option<Arc<LaunchBudget>>,
}

impl AppState {
    fn task_from(&self, body: &[u8]) -> FanoutResult<Task> {
        OrchestrateRequest::from_body(body)?.into_task(self.orchestrator.config().max_agents)
    }

    /// Validate `body`, charge the client one unit per requested worker, then submit.
    ///
    /// The charge is refunded when the submission launches nothing.
    async fn submit(
        &self,
        client: Option<&ClientKey>,
        body: &[u8],
    ) -> Result<Arc<OrchestrationSession>, ApiError> {
        let task = self.task_from(body)?;
        let charge = match (&self.budget, client) {
            (Some(budget), Some(ClientKey(client))) => {
                let cost = u32::try_from(task.agent_count()).unwrap_or(u32::MAX);
                Some(budget.charge(client, cost).await?)
            }
            _ => None,
        };

        match self.orchestrator.submit(task).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if let (Some(budget), Some(charge)) = (&self.budget, charge) {
                    budget.refund(charge).await;
                }
                Err(e.into())
            }
        }
    }
}

/// The submission gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without auth or launch budgets.
    pub fn build(orchestrator: Arc<Orchestrator>) -> Router {
        Self::build_with_middleware(orchestrator, None, AuthConfig::new(vec![]))
    }

    /// Build the gateway with optional launch budgets and auth middleware.
    pub fn build_with_middleware(
        orchestrator: Arc<Orchestrator>,
        budget: Option<Arc<LaunchBudget>>,
        auth_config: AuthConfig,
    ) -> Router {
        let state = Arc::new(AppState {
            orchestrator,
            budget: budget.clone(),
        });

        let app = Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/orchestrate", post(orchestrate_handler))
            .route("/orchestrate/stream", post(orchestrate_stream_handler))
            .route("/sessions/{id}", get(session_handler))
            .route("/sessions/{id}/stream", get(session_stream_handler))
            .route("/sessions/{id}/cancel", post(cancel_handler))
            .with_state(state);

        if budget.is_some() || auth_config.is_enabled() {
            let mw_state = Arc::new(MiddlewareState {
                budget,
                auth: auth_config,
            });

            app.layer(axum_mw::from_fn_with_state(
                mw_state.clone(),
                budget_middleware,
            ))
            .layer(axum_mw::from_fn_with_state(mw_state, auth_middleware))
        } else {
            app
        }
    }
}

/// Serve a session's records as newline-delimited JSON, replaying history first.
fn ndjson_stream(session: &Arc<OrchestrationSession>) -> Response {
    let session_id = session.id();
    let lines = session.subscribe().filter_map(move |record| {
        let line = match serde_json::to_string(&record) {
            Ok(mut line) => {
                line.push('\n');
                Some(Ok::<_, Infallible>(line))
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Dropping unserializable stream record");
                None
            }
        };
        future::ready(line)
    });

    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (HeaderName::from_static("x-session-id"), session_id.to_string()),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "fanout",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "orchestrate": "POST /orchestrate",
            "stream": "POST /orchestrate/stream",
            "session": "GET /sessions/{id}",
            "reconnect": "GET /sessions/{id}/stream",
            "cancel": "POST /sessions/{id}/cancel",
            "health": "GET /health",
            "ready": "GET /ready",
        },
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy", "service": "fanout"}))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    let substrate = state.orchestrator.launcher().substrate().name().to_string();
    match state.orchestrator.ready().await {
        Ok(()) => Json(serde_json::json!({"ready": true, "substrate": substrate})).into_response(),
        Err(e) => {
            warn!(substrate = %substrate, error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "ready": false,
                    "substrate": substrate,
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn orchestrate_handler(
    State(state): State<Arc<AppState>>,
    client: Option<Extension<ClientKey>>,
    body: Bytes,
) -> Result<Json<OrchestrationOutcome>, ApiError> {
    let session = state.submit(client.as_deref(), &body).await?;
    info!(
        session_id = %session.id(),
        agent_count = session.task().agent_count(),
        "Single-shot orchestration submitted"
    );

    let outcome = session
        .wait_outcome(state.orchestrator.config().session_timeout())
        .await?;
    info!(session_id = %outcome.session_id, state = %outcome.state, "Orchestration finished");
    Ok(Json(outcome))
}

async fn orchestrate_stream_handler(
    State(state): State<Arc<AppState>>,
    client: Option<Extension<ClientKey>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let session = state.submit(client.as_deref(), &body).await?;
    info!(
        session_id = %session.id(),
        agent_count = session.task().agent_count(),
        "Streaming orchestration submitted"
    );
    Ok(ndjson_stream(&session))
}

async fn session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session = state.orchestrator.session(id).await?;
    Ok(Json(session.snapshot()))
}

async fn session_stream_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state.orchestrator.session(id).await?;
    info!(session_id = %id, state = %session.state(), "Stream reconnected");
    Ok(ndjson_stream(&session))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session = state.orchestrator.cancel(id).await?;
    Ok(Json(session.snapshot()))
}
