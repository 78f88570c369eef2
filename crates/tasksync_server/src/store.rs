//! Persistence collaborator.
//!
//! The sync core only needs plain CRUD semantics from storage. [`Repository`]
//! captures them; [`MemoryStore`] is the in-process reference implementation
//! used by the server binary and tests.

use crate::error::{ServerError, ServerResult};
use crate::hub::UserId;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};
use tasksync_protocol::{
    Entity, EntityId, List, ListPatch, NewList, NewSubtask, NewTask, Subtask, SubtaskPatch, Task,
    TaskPatch,
};

/// A value produced by a write that has been committed.
///
/// The broadcaster only accepts committed values, so change notifications
/// cannot be emitted for speculative or failed writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T>(T);

impl<T> Committed<T> {
    /// Wraps a value. Repository implementations call this only once the
    /// write is durable.
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Returns the committed value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Committed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// CRUD operations the server needs from storage. Every method is scoped to
/// the acting user.
pub trait Repository: Send + Sync + 'static {
    /// Returns the user's tasks in order, with subtasks attached.
    fn tasks(&self, user: UserId) -> ServerResult<Vec<Task>>;
    /// Returns one task with subtasks attached.
    fn task(&self, user: UserId, id: EntityId) -> ServerResult<Task>;
    /// Creates a task at the end of the user's order.
    fn create_task(&self, user: UserId, new: NewTask) -> ServerResult<Committed<Task>>;
    /// Applies a patch to a task.
    fn update_task(&self, user: UserId, id: EntityId, patch: &TaskPatch)
        -> ServerResult<Committed<Task>>;
    /// Deletes a task and its subtasks.
    fn delete_task(&self, user: UserId, id: EntityId) -> ServerResult<Committed<EntityId>>;
    /// Moves the named tasks to the front, in order.
    fn reorder_tasks(&self, user: UserId, ids: &[EntityId])
        -> ServerResult<Committed<Vec<EntityId>>>;

    /// Creates a subtask under a task.
    fn create_subtask(
        &self,
        user: UserId,
        task_id: EntityId,
        new: NewSubtask,
    ) -> ServerResult<Committed<Subtask>>;
    /// Applies a patch to a subtask.
    fn update_subtask(
        &self,
        user: UserId,
        id: EntityId,
        patch: &SubtaskPatch,
    ) -> ServerResult<Committed<Subtask>>;
    /// Deletes a subtask.
    fn delete_subtask(&self, user: UserId, id: EntityId) -> ServerResult<Committed<EntityId>>;
    /// Reorders the subtasks of one task.
    fn reorder_subtasks(
        &self,
        user: UserId,
        task_id: EntityId,
        ids: &[EntityId],
    ) -> ServerResult<Committed<Vec<EntityId>>>;

    /// Returns the user's lists in order.
    fn lists(&self, user: UserId) -> ServerResult<Vec<List>>;
    /// Creates a list.
    fn create_list(&self, user: UserId, new: NewList) -> ServerResult<Committed<List>>;
    /// Renames a list.
    fn update_list(&self, user: UserId, id: EntityId, patch: &ListPatch)
        -> ServerResult<Committed<List>>;
    /// Deletes a list and every task in it.
    fn delete_list(&self, user: UserId, id: EntityId) -> ServerResult<Committed<EntityId>>;
    /// Reorders the user's lists.
    fn reorder_lists(&self, user: UserId, ids: &[EntityId])
        -> ServerResult<Committed<Vec<EntityId>>>;
}

#[derive(Default)]
struct UserData {
    tasks: Vec<Task>,
    subtasks: Vec<Subtask>,
    lists: Vec<List>,
}

impl UserData {
    fn task_index(&self, id: EntityId) -> ServerResult<usize> {
        self.tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| ServerError::NotFound("task".into()))
    }

    fn assembled(&self, task: &Task) -> Task {
        let mut task = task.clone();
        let mut subtasks: Vec<Subtask> = self
            .subtasks
            .iter()
            .filter(|s| s.task_id == task.id)
            .cloned()
            .collect();
        subtasks.sort_by_key(|s| s.sort_order);
        task.subtasks = subtasks;
        task
    }
}

/// Positions the named entities first, in the given order, and the rest after
/// them in their previous relative order. Unknown ids are ignored.
fn apply_order<E: Entity>(items: &mut [E], ids: &[EntityId]) {
    let rank = |item: &E| ids.iter().position(|id| *id == item.id());
    // Stable sort keeps unmentioned items in their prior relative order.
    items.sort_by_key(|item| match rank(item) {
        Some(pos) => (0, pos),
        None => (1, 0),
    });
    for (position, item) in items.iter_mut().enumerate() {
        item.set_sort_order(position as i32);
    }
}

fn require_text(text: &str, field: &str) -> ServerResult<()> {
    if text.trim().is_empty() {
        return Err(ServerError::InvalidRequest(format!("{field} is required")));
    }
    Ok(())
}

/// In-memory repository.
pub struct MemoryStore {
    users: RwLock<HashMap<UserId, UserData>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    /// Creates an empty store. Ids start at 1.
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn allocate_id(&self) -> EntityId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository for MemoryStore {
    fn tasks(&self, user: UserId) -> ServerResult<Vec<Task>> {
        let users = self.users.read();
        Ok(users
            .get(&user)
            .map(|data| data.tasks.iter().map(|t| data.assembled(t)).collect())
            .unwrap_or_default())
    }

    fn task(&self, user: UserId, id: EntityId) -> ServerResult<Task> {
        let users = self.users.read();
        let data = users
            .get(&user)
            .ok_or_else(|| ServerError::NotFound("task".into()))?;
        let index = data.task_index(id)?;
        Ok(data.assembled(&data.tasks[index]))
    }

    fn create_task(&self, user: UserId, new: NewTask) -> ServerResult<Committed<Task>> {
        require_text(&new.text, "text")?;
        let mut users = self.users.write();
        let data = users.entry(user).or_default();

        if let Some(list_id) = new.list_id {
            if !data.lists.iter().any(|l| l.id == list_id) {
                return Err(ServerError::InvalidRequest(format!("unknown list {list_id}")));
            }
        }

        let sort_order = data.tasks.iter().map(|t| t.sort_order + 1).max().unwrap_or(0);
        let mut task = new.provisional(self.allocate_id());
        task.user_id = user;
        task.sort_order = sort_order;
        data.tasks.push(task.clone());
        Ok(Committed::new(task))
    }

    fn update_task(
        &self,
        user: UserId,
        id: EntityId,
        patch: &TaskPatch,
    ) -> ServerResult<Committed<Task>> {
        if let Some(text) = &patch.text {
            require_text(text, "text")?;
        }
        let mut users = self.users.write();
        let data = users
            .get_mut(&user)
            .ok_or_else(|| ServerError::NotFound("task".into()))?;
        let index = data.task_index(id)?;

        if let Some(Some(list_id)) = patch.list_id {
            if !data.lists.iter().any(|l| l.id == list_id) {
                return Err(ServerError::InvalidRequest(format!("unknown list {list_id}")));
            }
        }

        let task = &mut data.tasks[index];
        patch.apply(task);
        task.updated_at = Utc::now();
        let task = data.tasks[index].clone();
        Ok(Committed::new(data.assembled(&task)))
    }

    fn delete_task(&self, user: UserId, id: EntityId) -> ServerResult<Committed<EntityId>> {
        let mut users = self.users.write();
        let data = users
            .get_mut(&user)
            .ok_or_else(|| ServerError::NotFound("task".into()))?;
        let index = data.task_index(id)?;
        data.tasks.remove(index);
        data.subtasks.retain(|s| s.task_id != id);
        Ok(Committed::new(id))
    }

    fn reorder_tasks(
        &self,
        user: UserId,
        ids: &[EntityId],
    ) -> ServerResult<Committed<Vec<EntityId>>> {
        let mut users = self.users.write();
        let data = users.entry(user).or_default();
        apply_order(&mut data.tasks, ids);
        Ok(Committed::new(ids.to_vec()))
    }

    fn create_subtask(
        &self,
        user: UserId,
        task_id: EntityId,
        new: NewSubtask,
    ) -> ServerResult<Committed<Subtask>> {
        require_text(&new.text, "text")?;
        let mut users = self.users.write();
        let data = users
            .get_mut(&user)
            .ok_or_else(|| ServerError::NotFound("task".into()))?;
        data.task_index(task_id)?;

        let sort_order = data
            .subtasks
            .iter()
            .filter(|s| s.task_id == task_id)
            .map(|s| s.sort_order + 1)
            .max()
            .unwrap_or(0);
        let mut subtask = new.provisional(self.allocate_id(), task_id);
        subtask.sort_order = sort_order;
        data.subtasks.push(subtask.clone());
        Ok(Committed::new(subtask))
    }

    fn update_subtask(
        &self,
        user: UserId,
        id: EntityId,
        patch: &SubtaskPatch,
    ) -> ServerResult<Committed<Subtask>> {
        if let Some(text) = &patch.text {
            require_text(text, "text")?;
        }
        let mut users = self.users.write();
        let subtask = users
            .get_mut(&user)
            .and_then(|data| data.subtasks.iter_mut().find(|s| s.id == id))
            .ok_or_else(|| ServerError::NotFound("subtask".into()))?;
        patch.apply(subtask);
        Ok(Committed::new(subtask.clone()))
    }

    fn delete_subtask(&self, user: UserId, id: EntityId) -> ServerResult<Committed<EntityId>> {
        let mut users = self.users.write();
        let data = users
            .get_mut(&user)
            .ok_or_else(|| ServerError::NotFound("subtask".into()))?;
        let before = data.subtasks.len();
        data.subtasks.retain(|s| s.id != id);
        if data.subtasks.len() == before {
            return Err(ServerError::NotFound("subtask".into()));
        }
        Ok(Committed::new(id))
    }

    fn reorder_subtasks(
        &self,
        user: UserId,
        task_id: EntityId,
        ids: &[EntityId],
    ) -> ServerResult<Committed<Vec<EntityId>>> {
        let mut users = self.users.write();
        let data = users
            .get_mut(&user)
            .ok_or_else(|| ServerError::NotFound("task".into()))?;
        data.task_index(task_id)?;

        let (mut siblings, others): (Vec<Subtask>, Vec<Subtask>) = data
            .subtasks
            .drain(..)
            .partition(|s| s.task_id == task_id);
        siblings.sort_by_key(|s| s.sort_order);
        apply_order(&mut siblings, ids);
        data.subtasks = others;
        data.subtasks.extend(siblings);
        Ok(Committed::new(ids.to_vec()))
    }

    fn lists(&self, user: UserId) -> ServerResult<Vec<List>> {
        let users = self.users.read();
        Ok(users
            .get(&user)
            .map(|data| data.lists.clone())
            .unwrap_or_default())
    }

    fn create_list(&self, user: UserId, new: NewList) -> ServerResult<Committed<List>> {
        require_text(&new.title, "title")?;
        let mut users = self.users.write();
        let data = users.entry(user).or_default();
        let mut list = new.provisional(self.allocate_id());
        list.user_id = user;
        list.sort_order = data.lists.len() as i32;
        data.lists.push(list.clone());
        Ok(Committed::new(list))
    }

    fn update_list(
        &self,
        user: UserId,
        id: EntityId,
        patch: &ListPatch,
    ) -> ServerResult<Committed<List>> {
        require_text(&patch.title, "title")?;
        let mut users = self.users.write();
        let list = users
            .get_mut(&user)
            .and_then(|data| data.lists.iter_mut().find(|l| l.id == id))
            .ok_or_else(|| ServerError::NotFound("list".into()))?;
        patch.apply(list);
        list.updated_at = Utc::now();
        Ok(Committed::new(list.clone()))
    }

    fn delete_list(&self, user: UserId, id: EntityId) -> ServerResult<Committed<EntityId>> {
        let mut users = self.users.write();
        let data = users
            .get_mut(&user)
            .ok_or_else(|| ServerError::NotFound("list".into()))?;
        let before = data.lists.len();
        data.lists.retain(|l| l.id != id);
        if data.lists.len() == before {
            return Err(ServerError::NotFound("list".into()));
        }

        let removed: Vec<EntityId> = data
            .tasks
            .iter()
            .filter(|t| t.list_id == Some(id))
            .map(|t| t.id)
            .collect();
        data.tasks.retain(|t| t.list_id != Some(id));
        data.subtasks.retain(|s| !removed.contains(&s.task_id));
        Ok(Committed::new(id))
    }

    fn reorder_lists(
        &self,
        user: UserId,
        ids: &[EntityId],
    ) -> ServerResult<Committed<Vec<EntityId>>> {
        let mut users = self.users.write();
        let data = users.entry(user).or_default();
        apply_order(&mut data.lists, ids);
        Ok(Committed::new(ids.to_vec()))
    }
}
