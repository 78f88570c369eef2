//! Access token signing and validation.
//!
//! Access tokens are short-lived bearer credentials signed with HMAC-SHA256.
//! They carry the user id and the issue time; expiry is checked against the
//! configured lifetime.
//!
//! ## Token Format
//!
//! - 8 bytes: user id (big-endian)
//! - 8 bytes: issue timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature over the first 16 bytes
//!
//! Total: 48 bytes, URL-safe base64 without padding for transport (the token
//! travels in a query string on the socket upgrade).

use crate::error::{ServerError, ServerResult};
use crate::hub::UserId;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 48;
const SIGNED_LEN: usize = 16;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Access token lifetime.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(15 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and validates access tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates an access token for a user.
    ///
    /// Returns the encoded token together with its expiry.
    pub fn create_token(&self, user_id: UserId) -> ServerResult<(String, DateTime<Utc>)> {
        let issued = now_millis();

        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(&user_id.to_be_bytes());
        token.extend_from_slice(&issued.to_be_bytes());
        let signature = self.sign(&token)?;
        token.extend_from_slice(&signature);

        let expires_ms = issued.saturating_add(self.config.token_expiry.as_millis() as u64);
        let expires_at = Utc
            .timestamp_millis_opt(expires_ms as i64)
            .single()
            .unwrap_or_else(Utc::now);

        Ok((URL_SAFE_NO_PAD.encode(token), expires_at))
    }

    /// Validates a token and returns the user it was issued to.
    pub fn validate(&self, token: &str) -> ServerResult<UserId> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;

        if bytes.len() != TOKEN_LEN {
            return Err(ServerError::AuthenticationFailed(
                "invalid token length".into(),
            ));
        }

        let (signed, signature) = bytes.split_at(SIGNED_LEN);
        // verify_slice compares in constant time.
        let mut mac = self.mac()?;
        mac.update(signed);
        if mac.verify_slice(signature).is_err() {
            return Err(ServerError::AuthenticationFailed("invalid signature".into()));
        }

        let mut user = [0u8; 8];
        user.copy_from_slice(&signed[0..8]);
        let mut issued = [0u8; 8];
        issued.copy_from_slice(&signed[8..16]);

        let issued = u64::from_be_bytes(issued);
        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if now_millis() > issued.saturating_add(expiry_millis) {
            return Err(ServerError::AuthenticationFailed(
                "invalid or expired token".into(),
            ));
        }

        Ok(i64::from_be_bytes(user))
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))
    }

    /// Signs data with HMAC-SHA256.
    fn sign(&self, data: &[u8]) -> ServerResult<[u8; 32]> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let mut parts = header.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}
