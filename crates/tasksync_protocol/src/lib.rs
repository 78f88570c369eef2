//! # TaskSync Protocol
//!
//! Wire types shared by the TaskSync server and its clients.
//!
//! This crate provides:
//! - REST entity shapes (`Task`, `Subtask`, `List`) and the [`Entity`] trait
//! - Request bodies for the mutation and auth endpoints
//! - The closed set of change notifications ([`Envelope`])
//! - Newline-delimited frame coalescing and splitting
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Wire format
//!
//! Every envelope is a JSON object `{"type": "...", "payload": ...}`. The
//! server may coalesce several envelopes into one WebSocket text frame by
//! joining them with `\n`; consumers apply the envelopes of a frame in order.
//!
//! ```
//! use tasksync_protocol::{split_frame, Envelope, EntityKind};
//!
//! let frame = "{\"type\":\"task_deleted\",\"payload\":{\"id\":7}}\n\
//!              {\"type\":\"lists_reordered\",\"payload\":{\"orderedIds\":[2,1]}}";
//! let envelopes: Vec<Envelope> = split_frame(frame).collect::<Result<_, _>>().unwrap();
//! assert_eq!(envelopes.len(), 2);
//! assert_eq!(envelopes[1].kind(), EntityKind::List);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod envelope;
mod error;
mod frame;
mod requests;

pub use entity::{is_temp_id, Entity, EntityId, EntityKind, List, Subtask, Task};
pub use envelope::{ChangeKind, EntityRef, Envelope, Reordered};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{join_frame, split_frame, FRAME_SEPARATOR};
pub use requests::{
    AuthSession, AuthTokens, ErrorBody, ListPatch, Login, NewList, NewSubtask, NewTask,
    Registration, RefreshRequest, SubtaskPatch, TaskPatch, User,
};
