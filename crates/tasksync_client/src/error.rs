//! Error types for the sync client.

use tasksync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the sync client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Network or socket failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server rejected the access token.
    #[error("unauthorized")]
    Unauthorized,

    /// The session could not be renewed; credentials have been cleared.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// No credential is present.
    #[error("not signed in")]
    NotSignedIn,

    /// The target entity still holds a provisional id; its create has not
    /// been confirmed yet.
    #[error("{kind} {id} is not synced yet")]
    NotSynced {
        /// Entity kind.
        kind: tasksync_protocol::EntityKind,
        /// Provisional id.
        id: tasksync_protocol::EntityId,
    },

    /// The entity is not in the local cache.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind.
        kind: tasksync_protocol::EntityKind,
        /// Requested id.
        id: tasksync_protocol::EntityId,
    },

    /// The server rejected a request.
    #[error("request rejected ({status}): {message}")]
    Mutation {
        /// HTTP status code.
        status: u16,
        /// Message from the error body.
        message: String,
    },

    /// A pushed envelope could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::Mutation { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error is an authentication failure of any kind.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ClientError::Unauthorized | ClientError::SessionExpired(_) | ClientError::NotSignedIn
        )
    }

    /// Returns true if the error should be shown to the user.
    ///
    /// Transport and protocol failures are recovered silently by reconnecting
    /// and dropping the envelope respectively.
    pub fn surfaces_to_user(&self) -> bool {
        !matches!(
            self,
            ClientError::Transport { .. } | ClientError::Protocol(_)
        )
    }
}
