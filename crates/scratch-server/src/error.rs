use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use scratch_core::error::ScratchError;

// ---------------------------------------------------------------------------
// Internal sentinels for statuses ScratchError does not carry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

#[derive(Debug)]
struct UnauthorizedError(String);

impl std::fmt::Display for UnauthorizedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UnauthorizedError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self(UnauthorizedError(msg.into()).into())
    }

    pub fn join(err: tokio::task::JoinError) -> Self {
        Self(anyhow::anyhow!("task join error: {err}"))
    }

    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<BadRequestError>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        if self.0.downcast_ref::<UnauthorizedError>().is_some() {
            return StatusCode::UNAUTHORIZED;
        }
        let Some(e) = self.0.downcast_ref::<ScratchError>() else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        match e {
            ScratchError::NotFound(_) => StatusCode::NOT_FOUND,
            ScratchError::Busy { .. } | ScratchError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            ScratchError::InvalidIdentity(_)
            | ScratchError::ReservedIdentity(_)
            | ScratchError::InvalidPath(_)
            | ScratchError::UnknownService(_)
            | ScratchError::UnknownProfile(_)
            | ScratchError::NoDatabase => StatusCode::BAD_REQUEST,
            ScratchError::ScriptFailure { .. } | ScratchError::Degraded { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ScratchError::RoutingUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ScratchError::ConfigNotFound
            | ScratchError::Config(_)
            | ScratchError::SpawnFailed { .. }
            | ScratchError::Cancelled(_)
            | ScratchError::Io(_)
            | ScratchError::Yaml(_)
            | ScratchError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = serde_json::json!({ "error": self.0.to_string() });
        if let Some(ScratchError::Degraded { identity, reasons }) = self.0.downcast_ref() {
            body["identity"] = serde_json::json!(identity);
            body["reasons"] = serde_json::json!(reasons);
        }
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.0, "request failed");
        }
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
