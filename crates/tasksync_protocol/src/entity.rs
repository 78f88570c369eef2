//! Entity shapes as returned by the REST API.

use crate::envelope::Envelope;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a task, subtask or list.
///
/// Server-assigned ids are strictly positive. Clients allocate provisional
/// ids from the negative range while a create is in flight.
pub type EntityId = i64;

/// Returns true if `id` belongs to the client-side provisional namespace.
pub fn is_temp_id(id: EntityId) -> bool {
    id < 0
}

/// The entity types that carry change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A task.
    Task,
    /// A subtask nested under a task.
    Subtask,
    /// A list grouping tasks.
    List,
}

impl EntityKind {
    /// All entity kinds, in a stable order.
    pub const ALL: [EntityKind; 3] = [EntityKind::Task, EntityKind::Subtask, EntityKind::List];

    /// Returns the singular wire name (`task`, `subtask`, `list`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Subtask => "subtask",
            EntityKind::List => "list",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common behaviour of the synchronized entity types.
pub trait Entity:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Which kind of entity this is.
    const KIND: EntityKind;

    /// Returns the entity id.
    fn id(&self) -> EntityId;

    /// Replaces the entity id.
    fn set_id(&mut self, id: EntityId);

    /// Replaces the position of the entity within its collection.
    fn set_sort_order(&mut self, sort_order: i32);

    /// Wraps the entity in a `*_created` envelope.
    fn into_created(self) -> Envelope;

    /// Wraps the entity in a `*_updated` envelope.
    fn into_updated(self) -> Envelope;
}

/// A task item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task id.
    pub id: EntityId,
    /// Owning user.
    pub user_id: i64,
    /// List the task belongs to, if any.
    #[serde(default)]
    pub list_id: Option<EntityId>,
    /// Task text.
    pub text: String,
    /// Whether the task is done.
    #[serde(default)]
    pub completed: bool,
    /// Whether the task is flagged important.
    #[serde(default)]
    pub important: bool,
    /// Whether the subtask panel is expanded.
    #[serde(default)]
    pub is_expanded: bool,
    /// Position among the user's tasks.
    #[serde(default)]
    pub sort_order: i32,
    /// Tags attached to the task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Subtasks, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<Subtask>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind::Task;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn set_sort_order(&mut self, sort_order: i32) {
        self.sort_order = sort_order;
    }

    fn into_created(self) -> Envelope {
        Envelope::TaskCreated(self)
    }

    fn into_updated(self) -> Envelope {
        Envelope::TaskUpdated(self)
    }
}

/// A subtask within a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    /// Subtask id.
    pub id: EntityId,
    /// Parent task.
    pub task_id: EntityId,
    /// Subtask text.
    pub text: String,
    /// Whether the subtask is done.
    #[serde(default)]
    pub completed: bool,
    /// Position within the parent task.
    #[serde(default)]
    pub sort_order: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Entity for Subtask {
    const KIND: EntityKind = EntityKind::Subtask;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn set_sort_order(&mut self, sort_order: i32) {
        self.sort_order = sort_order;
    }

    fn into_created(self) -> Envelope {
        Envelope::SubtaskCreated(self)
    }

    fn into_updated(self) -> Envelope {
        Envelope::SubtaskUpdated(self)
    }
}

/// A user-created list of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    /// List id.
    pub id: EntityId,
    /// Owning user.
    pub user_id: i64,
    /// Display title.
    pub title: String,
    /// Position among the user's lists.
    #[serde(default)]
    pub sort_order: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Entity for List {
    const KIND: EntityKind = EntityKind::List;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn set_sort_order(&mut self, sort_order: i32) {
        self.sort_order = sort_order;
    }

    fn into_created(self) -> Envelope {
        Envelope::ListCreated(self)
    }

    fn into_updated(self) -> Envelope {
        Envelope::ListUpdated(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_ids_are_negative() {
        assert!(is_temp_id(-1));
        assert!(!is_temp_id(0));
        assert!(!is_temp_id(42));
    }

    #[test]
    fn task_uses_camel_case() {
        let json = r#"{
            "id": 42, "userId": 7, "listId": null, "text": "Buy milk",
            "completed": false, "important": true, "isExpanded": false,
            "sortOrder": 3, "tags": ["errand"],
            "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.id, 42);
        assert_eq!(task.user_id, 7);
        assert_eq!(task.tags, vec!["errand".to_string()]);
        assert!(task.subtasks.is_empty());

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["sortOrder"], 3);
        assert!(value.get("subtasks").is_none());
    }

    #[test]
    fn kind_names() {
        assert_eq!(EntityKind::Subtask.to_string(), "subtask");
        assert_eq!(EntityKind::ALL.len(), 3);
    }
}
