use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tether_core::{IdError, SessionId};
use tether_session::SessionError;

/// Error body `{ "ok": false, "error": "<message>" }` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(id: &SessionId) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("session not found: {id}"))
    }
}

impl From<IdError> for ApiError {
    fn from(e: IdError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let status = match &e {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Factory(_) => StatusCode::BAD_GATEWAY,
            SessionError::Connection(inner) if inner.is_unsupported() => StatusCode::NOT_IMPLEMENTED,
            SessionError::Connection(_) => StatusCode::BAD_GATEWAY,
            SessionError::StartTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SessionError::Aborted(_) => StatusCode::CONFLICT,
            SessionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = self.status.as_u16(), error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "ok": false, "error": self.message }))).into_response()
    }
}
