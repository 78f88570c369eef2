//! WebSocket endpoint.
//!
//! The upgrade is refused with 401 unless the `token` query parameter carries
//! a valid access token. Each accepted socket runs two pumps:
//!
//! - the write pump drains the connection's queue, coalescing whatever is
//!   already buffered into one newline-joined frame, and pings on a timer;
//! - the read pump ignores message content but requires some inbound traffic
//!   (pongs included) within `pong_wait`.
//!
//! Whichever pump stops first takes the other down with it.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{CloseSignal, ConnectionState, ConnectionStatus, OutboundMessage, UserId};
use crate::state::AppState;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tasksync_protocol::join_frame;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, warn};

/// Query string of the upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Access token.
    pub token: Option<String>,
}

/// Handles `GET /ws?token=...`.
pub async fn upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Authenticate before looking at the upgrade itself so a bad credential
    // is always reported as 401.
    let user = match query.token.as_deref().map(|t| state.tokens.validate(t)) {
        Some(Ok(user)) => user,
        Some(Err(e)) => return e.into_response(),
        None => {
            return ServerError::AuthenticationFailed("missing token".into()).into_response()
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let max = state.config.max_message_size;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| serve_socket(socket, state, user))
}

async fn serve_socket(socket: WebSocket, state: AppState, user: UserId) {
    let connection = state.hub.connect(user);
    let id = connection.id;
    let status = connection.status();
    let (queue, close) = connection.into_parts();
    let (sink, stream) = socket.split();
    let (done_tx, done_rx) = oneshot::channel();

    let writer = tokio::spawn(write_pump(
        sink,
        queue,
        close,
        status.clone(),
        Arc::clone(&state.config),
        done_tx,
    ));
    let outcome = read_pump(stream, state.config.pong_wait, done_rx).await;
    status.finish(outcome);

    state.hub.unregister(user, id);
    if let Err(e) = writer.await {
        warn!(user, connection = %id, error = %e, "write pump panicked");
    }
    debug!(user, connection = %id, state = ?status.get(), "socket finished");
}

/// Drains the queue into the socket until the queue closes, the hub signals
/// close, or a write fails.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<OutboundMessage>,
    close: CloseSignal,
    status: ConnectionStatus,
    config: Arc<ServerConfig>,
    done: oneshot::Sender<()>,
) {
    let mut ping = interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        let result = tokio::select! {
            message = queue.recv() => match message {
                Some(first) => {
                    let frame = coalesce(first, &mut queue);
                    send(&mut sink, Message::Text(frame), config.write_wait).await
                }
                None => break,
            },
            _ = ping.tick() => send(&mut sink, Message::Ping(Vec::new()), config.write_wait).await,
            _ = close.closed() => break,
        };
        if let Err(reason) = result {
            debug!(%reason, "write failed, closing socket");
            break;
        }
    }

    status.advance(ConnectionState::Closing);
    let _ = timeout(config.write_wait, sink.send(Message::Close(None))).await;
    let _ = done.send(());
}

/// Joins `first` with every message already waiting in the queue.
fn coalesce(first: OutboundMessage, queue: &mut mpsc::Receiver<OutboundMessage>) -> String {
    let mut batch = vec![first];
    while let Ok(next) = queue.try_recv() {
        batch.push(next);
    }
    join_frame(batch)
}

async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    write_wait: Duration,
) -> Result<(), String> {
    match timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".into()),
    }
}

/// Reads until the peer closes, goes quiet for longer than `pong_wait`, or the
/// write pump finishes. Returns the terminal state of the connection.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    pong_wait: Duration,
    mut done: oneshot::Receiver<()>,
) -> ConnectionState {
    loop {
        tokio::select! {
            _ = &mut done => return ConnectionState::Failed,
            next = timeout(pong_wait, stream.next()) => match next {
                Err(_) => {
                    debug!("read deadline exceeded");
                    return ConnectionState::Failed;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return ConnectionState::Closed,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "read failed");
                    return ConnectionState::Failed;
                }
                // Inbound content is ignored; its arrival extends the deadline.
                Ok(Some(Ok(_))) => {}
            }
        }
    }
}
