//! Main sync server.

use crate::config::ServerConfig;
use crate::handler;
use crate::hub::Hub;
use crate::sessions::SessionStore;
use crate::state::AppState;
use crate::store::{MemoryStore, Repository};
use crate::users::UserStore;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// The sync server.
///
/// Wires the REST API, the WebSocket endpoint and the connection hub around a
/// repository.
///
/// # Example
///
/// ```
/// use tasksync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let tokens = server.sessions().issue(1).unwrap();
/// assert!(!tokens.access_token.is_empty());
///
/// // server.serve(listener, shutdown) runs it on a bound listener.
/// ```
pub struct SyncServer {
    state: AppState,
}

impl SyncServer {
    /// Creates a server backed by an in-memory store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Creates a server backed by an existing repository.
    pub fn with_store(config: ServerConfig, store: Arc<dyn Repository>) -> Self {
        Self {
            state: AppState::new(config, store),
        }
    }

    /// Returns the HTTP router.
    pub fn router(&self) -> Router {
        handler::router(self.state.clone())
    }

    /// Returns the connection hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }

    /// Returns the refresh session store.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.state.sessions
    }

    /// Returns the account store.
    pub fn users(&self) -> &Arc<UserStore> {
        &self.state.users
    }

    /// Returns the repository.
    pub fn store(&self) -> &Arc<dyn Repository> {
        &self.state.store
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Serves requests on `listener` until `shutdown` completes.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(%addr, "sync server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("sync server stopped");
        Ok(())
    }
}

impl Default for SyncServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}
