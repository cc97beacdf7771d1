use crate::budget::Denied;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fanout_core::FanoutError;
use tracing::{error, warn};

/// A request failure rendered as an HTTP response with a `{"error": ...}` body.
#[derive(Debug)]
pub enum ApiError {
    /// An engine error.
    Fanout(FanoutError),
    /// The client's launch budget cannot cover the request.
    Throttled(Denied),
}

impl ApiError {
    /// The status code this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Fanout(FanoutError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Fanout(FanoutError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Fanout(FanoutError::SubstrateUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fanout(FanoutError::TimedOut { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Fanout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Fanout(FanoutError::Validation(message)) => message.clone(),
            Self::Fanout(other) => other.to_string(),
            Self::Throttled(Denied {
                cost,
                retry_after: None,
            }) => format!("Request costs {cost} worker launches, more than the budget allows"),
            Self::Throttled(Denied { cost, .. }) => {
                format!("Launch budget exhausted: request costs {cost} worker launches")
            }
        }
    }
}

impl From<FanoutError> for ApiError {
    fn from(err: FanoutError) -> Self {
        Self::Fanout(err)
    }
}

impl From<Denied> for ApiError {
    fn from(denied: Denied) -> Self {
        Self::Throttled(denied)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %message, "Request rejected");
        }
        let body = Json(serde_json::json!({ "error": message }));
        match self {
            Self::Throttled(Denied {
                retry_after: Some(wait),
                ..
            }) => {
                // Whole seconds, rounded up.
                let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}
