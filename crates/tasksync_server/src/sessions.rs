//! Refresh-token sessions with rotation.
//!
//! A refresh token is an opaque random string bound to a user. Presenting it
//! to [`SessionStore::rotate`] consumes it and yields a fresh credential pair,
//! so re-presenting a consumed refresh token always fails.

use crate::auth::TokenValidator;
use crate::error::{ServerError, ServerResult};
use crate::hub::UserId;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::time::Duration;
use tasksync_protocol::AuthTokens;

#[derive(Debug, Clone)]
struct RefreshSession {
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

/// Issues credential pairs and rotates refresh tokens.
pub struct SessionStore {
    tokens: TokenValidator,
    refresh_ttl: Duration,
    sessions: Mutex<HashMap<String, RefreshSession>>,
}

impl SessionStore {
    /// Creates an empty session store.
    pub fn new(tokens: TokenValidator, refresh_ttl: Duration) -> Self {
        Self {
            tokens,
            refresh_ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a new credential pair for a user.
    pub fn issue(&self, user_id: UserId) -> ServerResult<AuthTokens> {
        let (access_token, expires_at) = self.tokens.create_token(user_id)?;
        let refresh_token = random_token();
        let ttl = chrono::Duration::from_std(self.refresh_ttl)
            .map_err(|e| ServerError::Internal(format!("refresh ttl: {e}")))?;

        self.sessions.lock().insert(
            refresh_token.clone(),
            RefreshSession {
                user_id,
                expires_at: Utc::now() + ttl,
            },
        );

        Ok(AuthTokens {
            access_token,
            refresh_token,
            expires_at,
        })
    }

    /// Consumes a refresh token and issues a replacement pair.
    pub fn rotate(&self, refresh_token: &str) -> ServerResult<AuthTokens> {
        let session = self.sessions.lock().remove(refresh_token);
        let session = session.ok_or_else(|| {
            ServerError::AuthenticationFailed("invalid or expired refresh token".into())
        })?;

        if session.expires_at <= Utc::now() {
            return Err(ServerError::AuthenticationFailed(
                "invalid or expired refresh token".into(),
            ));
        }

        tracing::debug!(user = session.user_id, "refresh token rotated");
        self.issue(session.user_id)
    }

    /// Revokes a refresh token. Unknown tokens are ignored.
    pub fn revoke(&self, refresh_token: &str) -> bool {
        self.sessions.lock().remove(refresh_token).is_some()
    }

    /// Drops expired sessions and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at > now);
        before - sessions.len()
    }

    /// Returns the number of live refresh sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns true if there are no live refresh sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the access token validator.
    pub fn validator(&self) -> &TokenValidator {
        &self.tokens
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
