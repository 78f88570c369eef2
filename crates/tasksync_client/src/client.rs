//! The assembled client.

use crate::api::RestApi;
use crate::auth::{AuthorizedClient, RefreshCoordinator};
use crate::config::{ClientConfig, ReconnectConfig};
use crate::credentials::CredentialStore;
use crate::error::ClientResult;
use crate::http::{HttpClient, HttpRefresher, ReqwestClient};
use crate::reconciler::Reconciler;
use crate::transport::{Connector, Transport, TransportState, WsConnector};
use std::sync::Arc;
use tracing::debug;

/// A signed-in TaskSync session: REST API with refresh coordination, the
/// notification transport and the reconciled cache, sharing one credential
/// store.
pub struct SyncClient<C: HttpClient = ReqwestClient, S: Connector = WsConnector> {
    api: RestApi<C>,
    transport: Transport<S>,
    reconciler: Arc<Reconciler>,
    credentials: CredentialStore,
}

impl SyncClient {
    /// Creates a client talking to the configured server over HTTP and
    /// WebSocket.
    pub fn new(config: ClientConfig, credentials: CredentialStore) -> ClientResult<Self> {
        Self::with_reconciler(config, credentials, Reconciler::new())
    }

    /// Creates a client over an existing cache, e.g. one restored with
    /// [`Reconciler::with_cache_file`].
    pub fn with_reconciler(
        config: ClientConfig,
        credentials: CredentialStore,
        reconciler: Reconciler,
    ) -> ClientResult<Self> {
        let connector = WsConnector::new(config.ws_url.clone());
        let reconnect = config.reconnect.clone();
        let http = ReqwestClient::new(config)?;
        Ok(Self::from_parts(
            Arc::new(http),
            Arc::new(connector),
            credentials,
            reconnect,
            reconciler,
        ))
    }
}

impl<C: HttpClient, S: Connector> SyncClient<C, S> {
    /// Assembles a client from its parts.
    pub fn from_parts(
        http: Arc<C>,
        connector: Arc<S>,
        credentials: CredentialStore,
        reconnect: ReconnectConfig,
        reconciler: Reconciler,
    ) -> Self {
        let refresher = Arc::new(HttpRefresher::new(Arc::clone(&http)));
        let coordinator = Arc::new(RefreshCoordinator::new(credentials.clone(), refresher));
        let api = RestApi::new(AuthorizedClient::new(
            http,
            credentials.clone(),
            Arc::clone(&coordinator),
        ));
        let transport =
            Transport::new(connector, credentials.clone(), reconnect).with_refresh(coordinator);
        Self {
            api,
            transport,
            reconciler: Arc::new(reconciler),
            credentials,
        }
    }

    /// Returns the REST API.
    pub fn api(&self) -> &RestApi<C> {
        &self.api
    }

    /// Returns the reconciled cache.
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Returns the notification transport.
    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    /// Returns the credential store.
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Returns the transport state.
    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    /// Runs the transport, feeding envelopes into the cache, until
    /// [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> ClientResult<()> {
        self.transport.run(&*self.reconciler).await
    }

    /// Refetches whatever the cache has marked stale.
    pub async fn refresh_stale(&self) -> ClientResult<()> {
        self.reconciler.refetch(&self.api).await
    }

    /// Signs out: revokes the session on the server and clears credentials,
    /// which disconnects the transport and cancels pending reconnects.
    pub async fn sign_out(&self) -> ClientResult<()> {
        debug!("signing out");
        self.api.logout().await
    }

    /// Stops the transport and writes out any pending cache snapshot.
    pub fn shutdown(&self) {
        self.transport.shutdown();
        self.reconciler.flush();
    }
}
