//! Change-notification socket with reconnect.
//!
//! The transport follows the credential store: it connects when a credential
//! appears, disconnects the moment it is cleared, and otherwise keeps a socket
//! open, reconnecting with capped exponential backoff. Frames are split into
//! envelopes and handed to an [`EnvelopeSink`] in arrival order.
//!
//! An upgrade rejected with 401 goes through the same [`RefreshCoordinator`]
//! as REST calls and reconnects at once with the refreshed token. A second
//! rejection right after a refresh signs the user out.

use crate::auth::RefreshCoordinator;
use crate::config::ReconnectConfig;
use crate::credentials::CredentialStore;
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tasksync_protocol::{split_frame, AuthTokens, Envelope};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use url::Url;

/// The current state of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No credential; nothing to connect with.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// The socket is open and delivering envelopes.
    Open,
    /// Waiting before reconnect attempt `attempt`.
    Reconnecting {
        /// Number of consecutive failures so far.
        attempt: u32,
    },
    /// Reconnect attempts are spent; waiting for a credential change.
    Exhausted,
    /// Shut down; terminal.
    Stopped,
}

impl TransportState {
    /// Returns true if the socket is open.
    pub fn is_open(&self) -> bool {
        matches!(self, TransportState::Open)
    }

    /// Returns true if the transport will not connect again on its own.
    pub fn is_parked(&self) -> bool {
        matches!(
            self,
            TransportState::Idle | TransportState::Exhausted | TransportState::Stopped
        )
    }
}

/// A stream of raw text frames.
pub type FrameStream = BoxStream<'static, ClientResult<String>>;

/// Opens the notification socket.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects with the given access token and returns the inbound frames.
    /// The stream ends when the socket closes.
    async fn connect(&self, access_token: &str) -> ClientResult<FrameStream>;
}

/// Receives envelopes from the transport.
pub trait EnvelopeSink: Send + Sync {
    /// Handles one envelope. Called in arrival order.
    fn deliver(&self, envelope: Envelope);

    /// Called each time a socket opens. Envelopes sent while disconnected are
    /// lost, so this is where consumers schedule a refetch.
    fn on_open(&self) {}
}

/// [`Connector`] over `tokio-tungstenite`, passing the token as the `token`
/// query parameter.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// Creates a connector for a socket URL.
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, access_token: &str) -> ClientResult<FrameStream> {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", access_token);

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
                    ClientError::Unauthorized
                }
                other => ClientError::transport_retryable(other.to_string()),
            })?;

        let frames = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes)
                        .map_err(|e| ClientError::transport_retryable(e.to_string())),
                ),
                // Control frames are answered by tungstenite itself.
                Ok(_) => None,
                Err(e) => Some(Err(ClientError::transport_retryable(e.to_string()))),
            }
        });
        Ok(frames.boxed())
    }
}

/// Outcome of one phase of the connection loop.
enum Next {
    /// Connect now, with a fresh attempt counter.
    Connect,
    /// Back off and retry.
    Retry,
    /// Stop the loop.
    Stop,
}

/// Resets the connect-in-flight flag on drop.
struct ConnectGuard<'a>(&'a AtomicBool);

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The notification socket lifecycle.
pub struct Transport<C: Connector> {
    connector: Arc<C>,
    credentials: CredentialStore,
    reconnect: ReconnectConfig,
    refresh: Option<Arc<RefreshCoordinator>>,
    state: watch::Sender<TransportState>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    connecting: AtomicBool,
    // Set when the last connect used a token refreshed after a rejection.
    refreshed: AtomicBool,
}

impl<C: Connector> Transport<C> {
    /// Creates a transport.
    pub fn new(connector: Arc<C>, credentials: CredentialStore, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(TransportState::Idle);
        let (shutdown, _) = watch::channel(false);
        Self {
            connector,
            credentials,
            reconnect,
            refresh: None,
            state,
            shutdown,
            running: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            refreshed: AtomicBool::new(false),
        }
    }

    /// Refreshes rejected credentials through `coordinator`. Without one, a
    /// rejected upgrade is retried like any other connect failure.
    pub fn with_refresh(mut self, coordinator: Arc<RefreshCoordinator>) -> Self {
        self.refresh = Some(coordinator);
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Returns true while a connect attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    /// Stops the transport. Any open socket is dropped and pending reconnects
    /// are cancelled.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn set_state(&self, next: TransportState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "transport state");
        }
    }

    fn try_begin_connect(&self) -> Option<ConnectGuard<'_>> {
        self.connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ConnectGuard(&self.connecting))
    }

    /// Runs the connection loop until [`shutdown`](Self::shutdown).
    ///
    /// Only one loop may run per transport; a second concurrent call fails
    /// immediately.
    pub async fn run<S>(&self, sink: &S) -> ClientResult<()>
    where
        S: EnvelopeSink + ?Sized,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::transport_fatal("transport already running"));
        }

        let mut credentials = self.credentials.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let current = credentials.borrow_and_update().clone();
            let Some(tokens) = current else {
                failures = 0;
                self.set_state(TransportState::Idle);
                match wait_for_change(&mut credentials, &mut shutdown).await {
                    Next::Stop => break,
                    _ => continue,
                }
            };

            let next = self
                .connect_and_read(&tokens, sink, &mut credentials, &mut shutdown, &mut failures)
                .await;
            match next {
                Next::Stop => break,
                Next::Connect => {
                    failures = 0;
                    continue;
                }
                Next::Retry => {}
            }

            if !self.reconnect.allows(failures) {
                warn!(failures, "reconnect attempts exhausted");
                self.set_state(TransportState::Exhausted);
                match wait_for_change(&mut credentials, &mut shutdown).await {
                    Next::Stop => break,
                    _ => {
                        failures = 0;
                        continue;
                    }
                }
            }

            let delay = self.reconnect.delay_for_attempt(failures);
            self.set_state(TransportState::Reconnecting { attempt: failures });
            debug!(attempt = failures, ?delay, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                next = wait_for_change(&mut credentials, &mut shutdown) => match next {
                    Next::Stop => break,
                    // Login, logout or rotation elsewhere: act on it now.
                    _ => failures = 0,
                },
            }
        }

        self.set_state(TransportState::Stopped);
        self.running.store(false, Ordering::SeqCst);
        info!("transport stopped");
        Ok(())
    }

    /// Connects once and reads until the socket ends. Updates `failures`.
    async fn connect_and_read<S>(
        &self,
        tokens: &AuthTokens,
        sink: &S,
        credentials: &mut watch::Receiver<Option<AuthTokens>>,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Next
    where
        S: EnvelopeSink + ?Sized,
    {
        let Some(guard) = self.try_begin_connect() else {
            *failures += 1;
            return Next::Retry;
        };
        self.set_state(TransportState::Connecting);

        let connected = tokio::select! {
            result = self.connector.connect(&tokens.access_token) => result,
            next = wait_for_change(credentials, shutdown) => return next,
        };
        drop(guard);

        let mut frames = match connected {
            Ok(frames) => frames,
            Err(ClientError::Unauthorized) => {
                return self.recover_rejected(tokens, shutdown, failures).await;
            }
            Err(e) => {
                *failures += 1;
                self.refreshed.store(false, Ordering::SeqCst);
                debug!(error = %e, failures = *failures, "connect failed");
                return Next::Retry;
            }
        };

        *failures = 0;
        self.refreshed.store(false, Ordering::SeqCst);
        self.set_state(TransportState::Open);
        info!("notification socket open");
        sink.on_open();

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => dispatch(&frame, sink),
                    Some(Err(e)) => {
                        debug!(error = %e, "socket error");
                        *failures += 1;
                        return Next::Retry;
                    }
                    None => {
                        debug!("socket closed by server");
                        *failures += 1;
                        return Next::Retry;
                    }
                },
                changed = credentials.changed() => {
                    if changed.is_err() {
                        return Next::Stop;
                    }
                    // A rotated pair keeps the open socket; only sign-out
                    // tears it down.
                    if credentials.borrow().is_none() {
                        info!("signed out, closing notification socket");
                        return Next::Connect;
                    }
                }
                next = stopped(shutdown) => return next,
            }
        }
    }

    /// Handles an upgrade rejected with 401.
    async fn recover_rejected(
        &self,
        rejected: &AuthTokens,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Next {
        let Some(coordinator) = &self.refresh else {
            *failures += 1;
            debug!(failures = *failures, "notification socket rejected the credential");
            return Next::Retry;
        };
        if self.refreshed.swap(false, Ordering::SeqCst) {
            warn!("notification socket rejected a refreshed credential, signing out");
            self.credentials.clear();
            return Next::Connect;
        }

        debug!("notification socket rejected the credential, refreshing");
        let refreshed = tokio::select! {
            result = coordinator.refreshed_token(&rejected.access_token) => result,
            next = stopped(shutdown) => return next,
        };
        match refreshed {
            Ok(_) => {
                self.refreshed.store(true, Ordering::SeqCst);
                Next::Connect
            }
            Err(e) => {
                // A failed refresh has already cleared the credential; the
                // backoff wait observes it.
                debug!(error = %e, "credential refresh for socket failed");
                *failures += 1;
                Next::Retry
            }
        }
    }
}

/// Splits a frame and delivers each envelope in order. Malformed envelopes
/// are dropped.
fn dispatch<S: EnvelopeSink + ?Sized>(frame: &str, sink: &S) {
    for envelope in split_frame(frame) {
        match envelope {
            Ok(envelope) => sink.deliver(envelope),
            Err(e) => warn!(error = %e, "dropping malformed envelope"),
        }
    }
}

/// Completes when the credential changes or shutdown is requested.
async fn wait_for_change(
    credentials: &mut watch::Receiver<Option<AuthTokens>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Next {
    tokio::select! {
        changed = credentials.changed() => {
            if changed.is_err() {
                Next::Stop
            } else {
                Next::Connect
            }
        }
        next = stopped(shutdown) => next,
    }
}

/// Completes when shutdown is requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) -> Next {
    loop {
        if *shutdown.borrow_and_update() {
            return Next::Stop;
        }
        if shutdown.changed().await.is_err() {
            return Next::Stop;
        }
    }
}
