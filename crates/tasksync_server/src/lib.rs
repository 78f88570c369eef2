//! # TaskSync Server
//!
//! Server side of TaskSync real-time synchronization.
//!
//! This crate provides:
//! - A connection [`Hub`] with per-user fanout and slow-consumer eviction
//! - A [`Broadcaster`] that emits change envelopes for committed writes
//! - REST endpoints for tasks, subtasks and lists
//! - A WebSocket endpoint with keep-alive and frame coalescing
//! - Accounts with Argon2 password hashes
//! - Access tokens (HMAC-SHA256) and rotating refresh sessions
//!
//! # Architecture
//!
//! A request handler writes through the [`Repository`], receives a
//! [`Committed`] value, and only then hands it to the broadcaster. Write and
//! broadcast share a per-user lock, so envelopes go out in commit order. The hub
//! serializes each envelope once and offers it, without blocking, to every
//! socket the acting user has open. A socket whose queue is full is closed;
//! its client will reconnect and refetch.
//!
//! # Authentication
//!
//! ```rust
//! use tasksync_server::{AuthConfig, TokenValidator};
//!
//! let validator = TokenValidator::new(AuthConfig::new(b"my-secret".to_vec()));
//! let (token, _expires_at) = validator.create_token(7).unwrap();
//! assert_eq!(validator.validate(&token).unwrap(), 7);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod emitter;
mod error;
mod handler;
mod hub;
mod server;
mod sessions;
mod state;
mod store;
mod users;
mod ws;

pub use auth::{bearer_token, AuthConfig, TokenValidator};
pub use config::{ServerConfig, DEV_SECRET};
pub use emitter::Broadcaster;
pub use error::{ServerError, ServerResult};
pub use handler::{router, AuthUser};
pub use hub::{
    CloseSignal, Connection, ConnectionId, ConnectionInfo, ConnectionState, ConnectionStatus, Hub,
    OutboundMessage, PublishReport, UserId,
};
pub use server::SyncServer;
pub use sessions::SessionStore;
pub use state::AppState;
pub use store::{Committed, MemoryStore, Repository};
pub use users::{UserStore, MIN_PASSWORD_LEN};
