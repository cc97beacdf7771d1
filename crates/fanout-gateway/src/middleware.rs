use crate::budget::{LaunchBudget, REQUEST_COST};
use crate::error::ApiError;
use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Paths that never require a key and are never charged.
const PROBE_PATHS: [&str; 2] = ["/health", "/ready"];

/// Paths whose handlers charge by worker count instead of a flat cost.
const SUBMISSION_PATHS: [&str; 2] = ["/orchestrate", "/orchestrate/stream"];

/// Auth configuration for the gateway.
#[derive(Clone)]
pub struct AuthConfig {
    /// API keys that are allowed to submit work. Empty = no auth required.
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    /// Accept any of `api_keys`.
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    /// Returns true if authentication is enabled (at least one key configured).
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }
}

/// Shared middleware state.
#[derive(Clone)]
pub struct MiddlewareState {
    /// Per-client launch budgets; `None` leaves requests uncharged.
    pub budget: Option<Arc<LaunchBudget>>,
    /// Accepted keys.
    pub auth: AuthConfig,
}

/// The identity a request is charged against, set by [`budget_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

/// `?api_key=` query parameter.
#[derive(serde::Deserialize, Default)]
pub struct AuthQuery {
    /// Key passed in the query string.
    pub api_key: Option<String>,
}

fn is_probe(request: &Request) -> bool {
    PROBE_PATHS.contains(&request.uri().path())
}

/// Key from `Authorization: Bearer <key>`, falling back to `?api_key=<key>`.
fn presented_key(headers: &HeaderMap, query: &AuthQuery) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query.api_key.clone())
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Auth middleware: validates the API key from header or query param.
///
/// If no API keys are configured, all requests are allowed. Probes are exempt.
pub async fn auth_middleware(
    State(state): State<Arc<MiddlewareState>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    if !state.auth.is_enabled() || is_probe(&request) {
        return next.run(request).await;
    }

    match presented_key(&headers, &query) {
        Some(k) if state.auth.api_keys.contains(&k) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected request: invalid API key");
            reject(StatusCode::UNAUTHORIZED, "Invalid API key")
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request: missing API key");
            reject(StatusCode::UNAUTHORIZED, "API key required")
        }
    }
}

fn is_submission(request: &Request) -> bool {
    request.method() == Method::POST && SUBMISSION_PATHS.contains(&request.uri().path())
}

/// API key when one is presented, otherwise the peer address when the server
/// was started with connect info.
fn client_key(headers: &HeaderMap, query: &AuthQuery, request: &Request) -> ClientKey {
    let key = presented_key(headers, query)
        .map(|key| format!("key:{key}"))
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| format!("ip:{}", addr.ip()))
        })
        .unwrap_or_else(|| "anonymous".to_string());
    ClientKey(key)
}

/// Launch budget middleware.
///
/// Tags every non-probe request with its [`ClientKey`]. Submissions are
/// charged later by their handler, once the worker count is known; any other
/// request is charged [`REQUEST_COST`] here.
pub async fn budget_middleware(
    State(state): State<Arc<MiddlewareState>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    mut request: Request,
    next: Next,
) -> Response {
    if is_probe(&request) {
        return next.run(request).await;
    }

    let client = client_key(&headers, &query, &request);
    if let Some(budget) = state.budget.as_ref().filter(|_| !is_submission(&request)) {
        if let Err(denied) = budget.charge(&client.0, REQUEST_COST).await {
            warn!(path = %request.uri().path(), client = %client.0, "Launch budget exhausted");
            return ApiError::from(denied).into_response();
        }
    }
    request.extensions_mut().insert(client);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_auth_config_disabled() {
        let config = AuthConfig::new(vec![]);
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_auth_config_enabled() {
        let config = AuthConfig::new(vec!["key123".to_string()]);
        assert!(config.is_enabled());
    }

    #[test]
    fn test_header_key_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer from-header"));
        let query = AuthQuery {
            api_key: Some("from-query".to_string()),
        };
        assert_eq!(
            presented_key(&headers, &query).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            presented_key(&HeaderMap::new(), &query).as_deref(),
            Some("from-query")
        );
        assert!(presented_key(&HeaderMap::new(), &AuthQuery::default()).is_none());
    }

    #[test]
    fn test_client_key_prefers_api_key_over_address() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 4000))));
        let query = AuthQuery {
            api_key: Some("k1".to_string()),
        };
        assert_eq!(
            client_key(&HeaderMap::new(), &query, &request),
            ClientKey("key:k1".to_string())
        );
        assert_eq!(
            client_key(&HeaderMap::new(), &AuthQuery::default(), &request),
            ClientKey("ip:10.0.0.7".to_string())
        );
        let bare = Request::new(axum::body::Body::empty());
        assert_eq!(
            client_key(&HeaderMap::new(), &AuthQuery::default(), &bare),
            ClientKey("anonymous".to_string())
        );
    }

    #[test]
    fn test_only_post_submissions_are_deferred() {
        let post = axum::http::Request::post("/orchestrate/stream")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(is_submission(&post));
        let get = axum::http::Request::get("/orchestrate")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(!is_submission(&get));
        let cancel = axum::http::Request::post("/sessions/x/cancel")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(!is_submission(&cancel));
    }
}
