//! Error types for the sync server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tasksync_protocol::ErrorBody;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format or content.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing, invalid or expired credential.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The entity does not exist for this user.
    #[error("{0} not found")]
    NotFound(String),

    /// The request clashes with existing state, e.g. a taken email.
    #[error("{0}")]
    Conflict(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotFound(_)
                | ServerError::Conflict(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_) | ServerError::Io(_))
    }

    /// Returns the HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Internal(_) | ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        // Internal details stay in the log.
        let error = match &self {
            ServerError::Internal(_) | ServerError::Io(_) => "internal server error".to_string(),
            ServerError::AuthenticationFailed(reason) => reason.clone(),
            other => other.to_string(),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert!(ServerError::NotFound("task".into()).is_client_error());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ServerError::AuthenticationFailed("expired".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServerError::NotFound("list".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ServerError::NotFound("list".into()).to_string(), "list not found");
        assert_eq!(
            ServerError::Conflict("email already registered".into()).status_code(),
            StatusCode::CONFLICT
        );
    }
}
