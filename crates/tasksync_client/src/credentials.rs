//! Shared credential slot.
//!
//! The access and refresh tokens always change together. Every component that
//! cares about sign-in state (the transport above all) subscribes to changes
//! instead of polling, so a login or logout made elsewhere takes effect
//! immediately.

use tasksync_protocol::AuthTokens;
use tokio::sync::watch;

/// Holds the current credential pair and broadcasts replacements.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    tx: watch::Sender<Option<AuthTokens>>,
}

impl CredentialStore {
    /// Creates a store holding `initial`.
    pub fn new(initial: Option<AuthTokens>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Returns the current credential pair.
    pub fn get(&self) -> Option<AuthTokens> {
        self.tx.borrow().clone()
    }

    /// Returns the current access token.
    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|t| t.access_token.clone())
    }

    /// Returns the current refresh token.
    pub fn refresh_token(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|t| t.refresh_token.clone())
    }

    /// Returns true if a credential is present.
    pub fn is_signed_in(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Replaces both tokens in one step.
    pub fn set(&self, tokens: AuthTokens) {
        self.tx.send_replace(Some(tokens));
    }

    /// Removes the credential. Subscribers see the sign-out immediately.
    pub fn clear(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    /// Subscribes to credential changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<AuthTokens>> {
        self.tx.subscribe()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(None)
    }
}
