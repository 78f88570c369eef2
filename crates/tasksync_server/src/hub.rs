//! Registry of live connections and per-user fanout.
//!
//! The hub maps each user to the set of sockets that user currently has open
//! (one per tab or device). Publishing an envelope serializes it once and
//! offers the bytes to every queue of that user without waiting: a full queue
//! means the consumer is too slow, and that connection is evicted instead of
//! stalling the publisher or anyone else's delivery.
//!
//! Every register, unregister and publish goes through the same mutex, so the
//! map is never observed half-updated.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tasksync_protocol::Envelope;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Identity of an authenticated user.
pub type UserId = i64;

/// A serialized envelope shared by every queue it is offered to.
pub type OutboundMessage = Arc<str>;

/// Identifier of one live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a connection.
///
/// `Connecting → Open → Closing → Closed`, or `Failed` from any live state.
/// `Closed` and `Failed` are terminal; resuming needs a fresh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade accepted, not yet registered.
    Connecting,
    /// Registered and receiving envelopes.
    Open,
    /// A close frame is being sent.
    Closing,
    /// Closed cleanly.
    Closed,
    /// Closed because of an error, a missed deadline or eviction.
    Failed,
}

impl ConnectionState {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Returns true if moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Connecting, Open) | (Open, Closing) | (Closing, Closed) => true,
            (Connecting | Open | Closing, Failed) => true,
            _ => false,
        }
    }
}

/// The current [`ConnectionState`] of one connection, shared by the hub and
/// the socket task. Illegal transitions are ignored.
#[derive(Debug, Clone)]
pub struct ConnectionStatus(Arc<Mutex<ConnectionState>>);

impl ConnectionStatus {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(ConnectionState::Connecting)))
    }

    /// Returns the current state.
    pub fn get(&self) -> ConnectionState {
        *self.0.lock()
    }

    /// Moves to `next` if that is a legal transition. Returns whether it moved.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.0.lock();
        if !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        true
    }

    /// Moves to a terminal state, passing through `Closing` on a clean close.
    pub fn finish(&self, terminal: ConnectionState) {
        if terminal == ConnectionState::Closed {
            self.advance(ConnectionState::Closing);
        }
        self.advance(terminal);
    }
}

/// Wakes the socket task when the hub drops its connection.
#[derive(Clone, Default)]
pub struct CloseSignal(Arc<Notify>);

impl CloseSignal {
    /// Completes once the hub has closed the connection.
    pub async fn closed(&self) {
        self.0.notified().await;
    }

    fn close(&self) {
        // notify_one stores a permit, so a waiter that arrives late still wakes.
        self.0.notify_one();
    }
}

struct ConnectionHandle {
    sender: mpsc::Sender<OutboundMessage>,
    close: CloseSignal,
    status: ConnectionStatus,
    connected_at: Instant,
}

/// The socket-side half of a registered connection.
pub struct Connection {
    /// Connection id.
    pub id: ConnectionId,
    /// Owning user.
    pub user: UserId,
    /// When the connection was registered.
    pub connected_at: Instant,
    receiver: mpsc::Receiver<OutboundMessage>,
    close: CloseSignal,
    status: ConnectionStatus,
}

impl Connection {
    /// Returns the connection's shared state.
    pub fn status(&self) -> ConnectionStatus {
        self.status.clone()
    }

    /// Splits the connection into its outbound queue and close signal.
    pub fn into_parts(self) -> (mpsc::Receiver<OutboundMessage>, CloseSignal) {
        (self.receiver, self.close)
    }
}

/// Summary of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// When the connection was registered.
    pub connected_at: Instant,
    /// Lifecycle state.
    pub state: ConnectionState,
}

/// Outcome of a publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Queues that accepted the envelope.
    pub delivered: usize,
    /// Connections dropped because their queue was full.
    pub evicted: usize,
}

/// The connection registry.
pub struct Hub {
    clients: Mutex<HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Hub {
    /// Creates an empty hub whose connections buffer up to `queue_capacity`
    /// messages each.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Allocates a connection for `user` and registers it.
    pub fn connect(&self, user: UserId) -> Connection {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let close = CloseSignal::default();
        let status = ConnectionStatus::new();
        let connected_at = Instant::now();

        self.register(
            user,
            id,
            ConnectionHandle {
                sender,
                close: close.clone(),
                status: status.clone(),
                connected_at,
            },
        );

        Connection {
            id,
            user,
            connected_at,
            receiver,
            close,
            status,
        }
    }

    /// Adds a connection to the user's set. Registering an id that is already
    /// present keeps the existing entry and returns false.
    fn register(&self, user: UserId, id: ConnectionId, handle: ConnectionHandle) -> bool {
        let mut clients = self.clients.lock();
        let connections = clients.entry(user).or_default();
        if connections.contains_key(&id) {
            return false;
        }
        handle.status.advance(ConnectionState::Open);
        connections.insert(id, handle);
        info!(user, connection = %id, total = connections.len(), "ws client connected");
        true
    }

    /// Removes a connection and closes its queue. A user left with no
    /// connections is dropped from the map.
    pub fn unregister(&self, user: UserId, id: ConnectionId) -> bool {
        let mut clients = self.clients.lock();
        let Some(connections) = clients.get_mut(&user) else {
            return false;
        };
        let Some(handle) = connections.remove(&id) else {
            return false;
        };
        handle.status.finish(ConnectionState::Closed);
        handle.close.close();
        if connections.is_empty() {
            clients.remove(&user);
        }
        info!(user, connection = %id, "ws client disconnected");
        true
    }

    /// Sends an envelope to every connection of `user`.
    ///
    /// The envelope is serialized once. Connections whose queue is full are
    /// force-closed and unregistered; the call never waits on a consumer.
    pub fn publish(&self, user: UserId, envelope: &Envelope) -> PublishReport {
        let message: OutboundMessage = match envelope.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!(error = %e, kind = envelope.type_name(), "failed to encode envelope");
                return PublishReport::default();
            }
        };
        self.publish_raw(user, message)
    }

    /// Offers an already-serialized message to every connection of `user`.
    pub fn publish_raw(&self, user: UserId, message: OutboundMessage) -> PublishReport {
        let mut report = PublishReport::default();
        let mut clients = self.clients.lock();
        let Some(connections) = clients.get_mut(&user) else {
            return report;
        };

        connections.retain(|id, handle| match handle.sender.try_send(Arc::clone(&message)) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(user, connection = %id, "send queue full, evicting slow consumer");
                handle.status.advance(ConnectionState::Failed);
                handle.close.close();
                report.evicted += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user, connection = %id, "dropping connection with closed queue");
                handle.status.advance(ConnectionState::Failed);
                handle.close.close();
                false
            }
        });

        if connections.is_empty() {
            clients.remove(&user);
        }
        report
    }

    /// Returns the live connections of a user.
    pub fn connections_for(&self, user: UserId) -> Vec<ConnectionInfo> {
        let clients = self.clients.lock();
        let mut infos: Vec<_> = clients
            .get(&user)
            .map(|connections| {
                connections
                    .iter()
                    .map(|(id, handle)| ConnectionInfo {
                        id: *id,
                        connected_at: handle.connected_at,
                        state: handle.status.get(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Returns the total number of live connections.
    pub fn connection_count(&self) -> usize {
        self.clients.lock().values().map(HashMap::len).sum()
    }

    /// Returns the number of users with at least one live connection.
    pub fn user_count(&self) -> usize {
        self.clients.lock().len()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(256)
    }
}
