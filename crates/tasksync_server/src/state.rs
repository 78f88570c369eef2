//! Shared state handed to every request handler.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::emitter::Broadcaster;
use crate::hub::Hub;
use crate::sessions::SessionStore;
use crate::store::Repository;
use crate::users::UserStore;
use std::sync::Arc;

/// Application state. Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry.
    pub hub: Arc<Hub>,
    /// Change broadcaster over `hub`.
    pub emitter: Broadcaster,
    /// Persistence collaborator.
    pub store: Arc<dyn Repository>,
    /// Access token validator.
    pub tokens: TokenValidator,
    /// Refresh sessions.
    pub sessions: Arc<SessionStore>,
    /// Registered accounts.
    pub users: Arc<UserStore>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Builds the state from a configuration and a repository.
    pub fn new(config: ServerConfig, store: Arc<dyn Repository>) -> Self {
        let hub = Arc::new(Hub::new(config.send_queue_capacity));
        let tokens = TokenValidator::new(config.auth_config());
        let sessions = Arc::new(SessionStore::new(tokens.clone(), config.refresh_token_ttl));

        Self {
            emitter: Broadcaster::new(Arc::clone(&hub)),
            hub,
            store,
            tokens,
            sessions,
            users: Arc::new(UserStore::new()),
            config: Arc::new(config),
        }
    }
}
