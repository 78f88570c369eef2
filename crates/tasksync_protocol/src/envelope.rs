//! Change notifications pushed from the server to connected sessions.

use crate::entity::{EntityId, EntityKind, List, Subtask, Task};
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Payload of a `*_deleted` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Id of the removed entity.
    pub id: EntityId,
}

/// Payload of a `*_reordered` envelope.
///
/// Carries the complete new order of the named ids rather than per-item diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reordered {
    /// Ids in their new order.
    #[serde(rename = "orderedIds", alias = "taskIds")]
    pub ordered_ids: Vec<EntityId>,
}

/// The kind of change an envelope describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// An entity was created.
    Created,
    /// An entity was replaced by a newer version.
    Updated,
    /// An entity was removed.
    Deleted,
    /// A batch of entities changed position.
    Reordered,
}

/// A typed change notification.
///
/// Serialized as `{"type": "<kind>", "payload": <payload>}`. The set of kinds
/// is closed and the payload shape is fixed per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    /// A task was created.
    TaskCreated(Task),
    /// A task was updated.
    TaskUpdated(Task),
    /// A task was deleted.
    TaskDeleted(EntityRef),
    /// Tasks were reordered.
    TasksReordered(Reordered),
    /// A subtask was created.
    SubtaskCreated(Subtask),
    /// A subtask was updated.
    SubtaskUpdated(Subtask),
    /// A subtask was deleted.
    SubtaskDeleted(EntityRef),
    /// Subtasks were reordered.
    SubtasksReordered(Reordered),
    /// A list was created.
    ListCreated(List),
    /// A list was updated.
    ListUpdated(List),
    /// A list was deleted.
    ListDeleted(EntityRef),
    /// Lists were reordered.
    ListsReordered(Reordered),
}

impl Envelope {
    /// Creates a `*_deleted` envelope for the given kind.
    pub fn deleted(kind: EntityKind, id: EntityId) -> Self {
        let payload = EntityRef { id };
        match kind {
            EntityKind::Task => Envelope::TaskDeleted(payload),
            EntityKind::Subtask => Envelope::SubtaskDeleted(payload),
            EntityKind::List => Envelope::ListDeleted(payload),
        }
    }

    /// Creates a `*_reordered` envelope for the given kind.
    pub fn reordered(kind: EntityKind, ordered_ids: Vec<EntityId>) -> Self {
        let payload = Reordered { ordered_ids };
        match kind {
            EntityKind::Task => Envelope::TasksReordered(payload),
            EntityKind::Subtask => Envelope::SubtasksReordered(payload),
            EntityKind::List => Envelope::ListsReordered(payload),
        }
    }

    /// Returns the entity type this envelope concerns.
    pub fn kind(&self) -> EntityKind {
        match self {
            Envelope::TaskCreated(_)
            | Envelope::TaskUpdated(_)
            | Envelope::TaskDeleted(_)
            | Envelope::TasksReordered(_) => EntityKind::Task,
            Envelope::SubtaskCreated(_)
            | Envelope::SubtaskUpdated(_)
            | Envelope::SubtaskDeleted(_)
            | Envelope::SubtasksReordered(_) => EntityKind::Subtask,
            Envelope::ListCreated(_)
            | Envelope::ListUpdated(_)
            | Envelope::ListDeleted(_)
            | Envelope::ListsReordered(_) => EntityKind::List,
        }
    }

    /// Returns the kind of change.
    pub fn change(&self) -> ChangeKind {
        match self {
            Envelope::TaskCreated(_) | Envelope::SubtaskCreated(_) | Envelope::ListCreated(_) => {
                ChangeKind::Created
            }
            Envelope::TaskUpdated(_) | Envelope::SubtaskUpdated(_) | Envelope::ListUpdated(_) => {
                ChangeKind::Updated
            }
            Envelope::TaskDeleted(_) | Envelope::SubtaskDeleted(_) | Envelope::ListDeleted(_) => {
                ChangeKind::Deleted
            }
            Envelope::TasksReordered(_)
            | Envelope::SubtasksReordered(_)
            | Envelope::ListsReordered(_) => ChangeKind::Reordered,
        }
    }

    /// Returns the wire name of the envelope type (e.g. `task_created`).
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::TaskCreated(_) => "task_created",
            Envelope::TaskUpdated(_) => "task_updated",
            Envelope::TaskDeleted(_) => "task_deleted",
            Envelope::TasksReordered(_) => "tasks_reordered",
            Envelope::SubtaskCreated(_) => "subtask_created",
            Envelope::SubtaskUpdated(_) => "subtask_updated",
            Envelope::SubtaskDeleted(_) => "subtask_deleted",
            Envelope::SubtasksReordered(_) => "subtasks_reordered",
            Envelope::ListCreated(_) => "list_created",
            Envelope::ListUpdated(_) => "list_updated",
            Envelope::ListDeleted(_) => "list_deleted",
            Envelope::ListsReordered(_) => "lists_reordered",
        }
    }

    /// Serializes the envelope to a single JSON line.
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parses a single envelope.
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(|source| ProtocolError::Malformed {
            position: 0,
            source,
        })
    }
}
