use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend closed")]
    BackendClosed,
    #[error("relay i/o error: {0}")]
    RelayIo(String),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("required binary '{0}' not found in PATH")]
    MissingBinary(String),
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConsoleError {
    pub(crate) fn unavailable(context: &str, err: impl std::fmt::Display) -> Self {
        ConsoleError::BackendUnavailable(format!("{context}: {err}"))
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            ConsoleError::UpgradeFailed(_) => (StatusCode::BAD_REQUEST, "upgrade_failed"),
            ConsoleError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ConsoleError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ConsoleError::CommandFailed { .. } => (StatusCode::BAD_GATEWAY, "command_failed"),
            ConsoleError::MissingBinary(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "missing_dependency")
            }
            ConsoleError::BackendUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable")
            }
            ConsoleError::BackendClosed | ConsoleError::RelayIo(_) | ConsoleError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = ErrorBody {
            code: code.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_status_codes() {
        let cases = [
            (
                ConsoleError::NotFound("abc".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                ConsoleError::InvalidRequest("empty".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ConsoleError::CommandFailed {
                    command: "docker start abc".into(),
                    message: "boom".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                ConsoleError::MissingBinary("docker".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn command_failure_message_includes_command() {
        let err = ConsoleError::CommandFailed {
            command: "docker stop abc".into(),
            message: "daemon not running".into(),
        };
        assert_eq!(
            err.to_string(),
            "command 'docker stop abc' failed: daemon not running"
        );
    }
}
