//! # TaskSync Client
//!
//! Client side of TaskSync real-time synchronization.
//!
//! This crate provides:
//! - A notification [`Transport`] with capped exponential backoff that follows
//!   the [`CredentialStore`]
//! - An optimistic [`Reconciler`] merging local edits, REST results and pushed
//!   envelopes into one cache
//! - A single-flight [`RefreshCoordinator`] guarding every REST call
//! - Typed REST endpoints ([`TaskApi`], [`RestApi`])
//! - An atomically written cache snapshot ([`CacheFile`])
//!
//! ## Architecture
//!
//! All components share one [`CredentialStore`]. A REST call that fails with
//! 401 goes through the coordinator, which refreshes once for any number of
//! concurrent failures. Clearing the store (logout, failed refresh) stops the
//! transport and cancels pending reconnects; storing a new pair connects it.
//!
//! ```text
//!   mutation ──► Reconciler (optimistic edit) ──► RestApi ──► server
//!                     ▲                                          │
//!                     └── Transport ◄── envelope frames ◄────────┘
//! ```
//!
//! ## Key Invariants
//!
//! - Provisional ids are negative; server ids never are
//! - A create confirmed by both REST and broadcast yields exactly one entity
//! - A failed mutation restores the exact pre-mutation collections
//! - Envelopes are applied in arrival order
//! - At most one refresh call is in flight per process
//!
//! ## Example
//!
//! ```
//! use tasksync_client::Reconciler;
//! use tasksync_protocol::{Envelope, EntityKind, NewTask};
//!
//! let cache = Reconciler::new();
//! let mut task = NewTask::parse("Buy milk #errand", None).provisional(42);
//! task.user_id = 7;
//! cache.apply(Envelope::TaskCreated(task.clone()));
//! cache.apply(Envelope::TaskCreated(task));
//! assert_eq!(cache.tasks().len(), 1);
//!
//! cache.apply(Envelope::deleted(EntityKind::Task, 42));
//! assert!(cache.tasks().is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod api;
mod auth;
mod cache;
mod client;
mod config;
mod credentials;
mod error;
mod http;
mod persist;
mod reconciler;
mod transport;

pub use api::{RestApi, TaskApi};
pub use auth::{AuthorizedClient, RefreshCoordinator};
pub use cache::{Collection, TempIds};
pub use client::SyncClient;
pub use config::{ClientConfig, ReconnectConfig};
pub use credentials::CredentialStore;
pub use error::{ClientError, ClientResult};
pub use http::{
    ApiRequest, ApiResponse, HttpClient, HttpRefresher, Method, ReqwestClient, TokenRefresher,
};
pub use persist::{CacheFile, CacheWriter, PersistedCache};
pub use reconciler::{CacheState, Reconciler};
pub use transport::{
    Connector, EnvelopeSink, FrameStream, Transport, TransportState, WsConnector,
};
