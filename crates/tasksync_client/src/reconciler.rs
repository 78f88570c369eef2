//! Optimistic cache reconciliation.
//!
//! The [`Reconciler`] keeps one authoritative collection per entity kind and
//! merges three sources into it:
//!
//! - **local edits**, applied immediately with a rollback snapshot
//! - **REST results**, which settle those edits
//! - **pushed envelopes**, applied in arrival order
//!
//! A confirmed create removes both the provisional entry and any copy already
//! present under the server id before inserting, so a REST response and the
//! broadcast of the same change never produce a duplicate, whichever lands
//! first. Every settled mutation marks its kinds stale so a later
//! [`refetch`](Reconciler::refetch) heals anything a missed envelope left
//! behind.
//!
//! Dropping a mutation's future before the server answers (a timeout, an
//! aborted task) rolls its edit back as if the request had failed. Two
//! concurrent mutations of the same entity settle in completion order and the
//! last one observed wins; there is no version check.

use crate::api::TaskApi;
use crate::cache::{Collection, TempIds};
use crate::error::{ClientError, ClientResult};
use crate::persist::{CacheFile, CacheWriter};
use crate::transport::EnvelopeSink;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tasksync_protocol::{
    is_temp_id, EntityId, EntityKind, Envelope, List, ListPatch, NewList, NewSubtask, NewTask,
    Subtask, SubtaskPatch, Task, TaskPatch,
};
use tracing::{debug, trace, warn};

/// The reconciled collections.
///
/// Tasks are stored without their `subtasks`; subtasks live in their own
/// collection and views reassemble them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheState {
    /// Tasks in display order.
    pub tasks: Collection<Task>,
    /// Subtasks of all tasks, each task's group in display order.
    pub subtasks: Collection<Subtask>,
    /// Lists in display order.
    pub lists: Collection<List>,
}

impl CacheState {
    /// Adds a task unless its id is present, moving its nested subtasks into
    /// the subtask collection.
    fn insert_task(&mut self, task: Task) -> bool {
        let (task, subtasks) = detach(task);
        if !self.tasks.insert_if_absent(task) {
            return false;
        }
        for subtask in subtasks {
            self.subtasks.insert_if_absent(subtask);
        }
        true
    }

    fn remove_task(&mut self, id: EntityId) {
        self.tasks.remove(id);
        self.subtasks.retain(|subtask| subtask.task_id != id);
    }

    /// Removes a list and, mirroring the server, every task filed under it.
    fn remove_list(&mut self, id: EntityId) {
        self.lists.remove(id);
        let doomed: Vec<EntityId> = self
            .tasks
            .iter()
            .filter(|task| task.list_id == Some(id))
            .map(|task| task.id)
            .collect();
        for task_id in doomed {
            self.remove_task(task_id);
        }
    }

    fn replace_tasks(&mut self, fetched: Vec<Task>) {
        let pending_tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| is_temp_id(t.id))
            .cloned()
            .collect();
        let pending_subtasks: Vec<Subtask> = self
            .subtasks
            .iter()
            .filter(|s| is_temp_id(s.id))
            .cloned()
            .collect();

        self.tasks = Collection::new();
        self.subtasks = Collection::new();
        for task in fetched {
            self.insert_task(task);
        }
        for task in pending_tasks {
            self.tasks.insert_if_absent(task);
        }
        for subtask in pending_subtasks {
            if self.tasks.contains(subtask.task_id) {
                self.subtasks.insert_if_absent(subtask);
            }
        }
    }

    fn replace_lists(&mut self, fetched: Vec<List>) {
        let pending: Vec<List> = self
            .lists
            .iter()
            .filter(|l| is_temp_id(l.id))
            .cloned()
            .collect();
        self.lists = Collection::from_vec(fetched);
        for list in pending {
            self.lists.insert_if_absent(list);
        }
    }

    fn reorder_subtasks(&mut self, ordered_ids: &[EntityId]) {
        let Some(task_id) = ordered_ids
            .iter()
            .find_map(|&id| self.subtasks.get(id).map(|s| s.task_id))
        else {
            return;
        };
        self.subtasks
            .reorder_subset(ordered_ids, |subtask| subtask.task_id == task_id);
    }

    fn assemble(&self, task: &Task) -> Task {
        let mut task = task.clone();
        task.subtasks = self
            .subtasks
            .iter()
            .filter(|subtask| subtask.task_id == task.id)
            .cloned()
            .collect();
        task
    }
}

fn detach(mut task: Task) -> (Task, Vec<Subtask>) {
    let subtasks = std::mem::take(&mut task.subtasks);
    (task, subtasks)
}

/// Rollback copy of the collections a mutation touches.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    tasks: Option<Collection<Task>>,
    subtasks: Option<Collection<Subtask>>,
    lists: Option<Collection<List>>,
}

impl Snapshot {
    fn capture(state: &CacheState, kinds: &[EntityKind]) -> Self {
        let mut snapshot = Snapshot::default();
        for kind in kinds {
            match kind {
                EntityKind::Task => snapshot.tasks = Some(state.tasks.clone()),
                EntityKind::Subtask => snapshot.subtasks = Some(state.subtasks.clone()),
                EntityKind::List => snapshot.lists = Some(state.lists.clone()),
            }
        }
        snapshot
    }

    fn restore(self, state: &mut CacheState) {
        if let Some(tasks) = self.tasks {
            state.tasks = tasks;
        }
        if let Some(subtasks) = self.subtasks {
            state.subtasks = subtasks;
        }
        if let Some(lists) = self.lists {
            state.lists = lists;
        }
    }
}

/// An optimistic edit awaiting its REST result.
///
/// Holds the rollback snapshot until [`Reconciler::finish`] takes it. If the
/// mutation is dropped before that, the snapshot is restored on drop.
struct PendingMutation<'a> {
    reconciler: &'a Reconciler,
    kinds: &'static [EntityKind],
    temp_id: Option<EntityId>,
    snapshot: Option<Snapshot>,
}

impl Drop for PendingMutation<'_> {
    fn drop(&mut self) {
        let Some(snapshot) = self.snapshot.take() else {
            return;
        };
        warn!(
            kinds = ?self.kinds,
            temp_id = ?self.temp_id,
            "mutation abandoned before the server answered, rolling back"
        );
        snapshot.restore(&mut *self.reconciler.state.lock());
        self.reconciler.release(self.kinds);
    }
}

const TASKS: &[EntityKind] = &[EntityKind::Task];
const TASK_TREE: &[EntityKind] = &[EntityKind::Task, EntityKind::Subtask];
const SUBTASKS: &[EntityKind] = &[EntityKind::Subtask];
const LISTS: &[EntityKind] = &[EntityKind::List];
const EVERYTHING: &[EntityKind] = &EntityKind::ALL;

/// Client-side cache reconciling optimistic edits, REST results and pushed
/// envelopes.
pub struct Reconciler {
    state: Mutex<CacheState>,
    temp_ids: TempIds,
    stale: Mutex<HashSet<EntityKind>>,
    in_flight: AtomicUsize,
    persist: Option<Arc<CacheWriter>>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    /// Creates an empty, non-persistent cache.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            temp_ids: TempIds::new(),
            stale: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            persist: None,
        }
    }

    /// Creates a cache mirrored to `file`, resuming from its last snapshot.
    ///
    /// Everything starts stale: the snapshot may predate changes made by other
    /// sessions, and lists are never persisted.
    pub fn with_cache_file(file: CacheFile) -> ClientResult<Self> {
        let mut reconciler = Self::new();
        if let Some(snapshot) = file.load()? {
            debug!(
                tasks = snapshot.tasks.len(),
                saved_at = %snapshot.saved_at,
                "restored cache snapshot"
            );
            let mut state = reconciler.state.lock();
            for task in snapshot.tasks {
                state.insert_task(task);
            }
        }
        reconciler.persist = Some(CacheWriter::new(file));
        reconciler.mark_stale(&EntityKind::ALL);
        Ok(reconciler)
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Returns tasks in display order with their subtasks attached.
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.state.lock();
        state.tasks.iter().map(|task| state.assemble(task)).collect()
    }

    /// Returns one task with its subtasks attached.
    pub fn task(&self, id: EntityId) -> Option<Task> {
        let state = self.state.lock();
        state.tasks.get(id).map(|task| state.assemble(task))
    }

    /// Returns the subtasks of a task in display order.
    pub fn subtasks_of(&self, task_id: EntityId) -> Vec<Subtask> {
        self.state
            .lock()
            .subtasks
            .iter()
            .filter(|subtask| subtask.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Returns lists in display order.
    pub fn lists(&self) -> Vec<List> {
        self.state.lock().lists.as_slice().to_vec()
    }

    /// Returns a copy of the raw collections.
    pub fn snapshot(&self) -> CacheState {
        self.state.lock().clone()
    }

    /// Returns the number of mutations awaiting a REST result.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Staleness
    // =========================================================================

    /// Marks kinds for a background refetch.
    pub fn mark_stale(&self, kinds: &[EntityKind]) {
        self.stale.lock().extend(kinds.iter().copied());
    }

    /// Returns true if `kind` needs a refetch.
    pub fn is_stale(&self, kind: EntityKind) -> bool {
        self.stale.lock().contains(&kind)
    }

    /// Takes and clears the stale set.
    pub fn take_stale(&self) -> Vec<EntityKind> {
        let mut stale = self.stale.lock();
        EntityKind::ALL
            .into_iter()
            .filter(|kind| stale.remove(kind))
            .collect()
    }

    /// Replaces the collections with a fetched state.
    pub fn hydrate(&self, tasks: Vec<Task>, lists: Vec<List>) {
        {
            let mut state = self.state.lock();
            state.replace_tasks(tasks);
            state.replace_lists(lists);
        }
        self.persist();
    }

    /// Refetches every stale kind from the server.
    ///
    /// Entries still holding provisional ids survive the replacement; their
    /// creates settle against the fetched state as usual. On failure the kinds
    /// stay stale.
    pub async fn refetch<A: TaskApi + ?Sized>(&self, api: &A) -> ClientResult<()> {
        let kinds = self.take_stale();
        if kinds.is_empty() {
            return Ok(());
        }

        let wants_tasks = kinds
            .iter()
            .any(|kind| matches!(kind, EntityKind::Task | EntityKind::Subtask));
        let wants_lists = kinds.contains(&EntityKind::List);

        let tasks = if wants_tasks {
            match api.tasks().await {
                Ok(tasks) => Some(tasks),
                Err(e) => {
                    self.mark_stale(&kinds);
                    return Err(e);
                }
            }
        } else {
            None
        };
        let lists = if wants_lists {
            match api.lists().await {
                Ok(lists) => Some(lists),
                Err(e) => {
                    self.mark_stale(&kinds);
                    return Err(e);
                }
            }
        } else {
            None
        };

        {
            let mut state = self.state.lock();
            if let Some(tasks) = tasks {
                state.replace_tasks(tasks);
            }
            if let Some(lists) = lists {
                state.replace_lists(lists);
            }
        }
        debug!(?kinds, "refetched");
        self.persist();
        Ok(())
    }

    // =========================================================================
    // Envelopes
    // =========================================================================

    /// Applies one pushed envelope.
    ///
    /// `created` inserts only if the id is absent; `updated` replaces by id;
    /// `deleted` removes by id; `reordered` moves the named ids first and
    /// appends the rest. Deleting a list removes its tasks, deleting a task
    /// removes its subtasks.
    pub fn apply(&self, envelope: Envelope) {
        trace!(kind = envelope.type_name(), "applying envelope");
        {
            let mut state = self.state.lock();
            match envelope {
                Envelope::TaskCreated(task) => {
                    state.insert_task(task);
                }
                Envelope::TaskUpdated(task) => {
                    state.tasks.replace(detach(task).0);
                }
                Envelope::TaskDeleted(entity) => state.remove_task(entity.id),
                Envelope::TasksReordered(order) => state.tasks.reorder(&order.ordered_ids),
                Envelope::SubtaskCreated(subtask) => {
                    state.subtasks.insert_if_absent(subtask);
                }
                Envelope::SubtaskUpdated(subtask) => {
                    state.subtasks.replace(subtask);
                }
                Envelope::SubtaskDeleted(entity) => {
                    state.subtasks.remove(entity.id);
                }
                Envelope::SubtasksReordered(order) => state.reorder_subtasks(&order.ordered_ids),
                Envelope::ListCreated(list) => {
                    state.lists.insert_if_absent(list);
                }
                Envelope::ListUpdated(list) => {
                    state.lists.replace(list);
                }
                Envelope::ListDeleted(entity) => state.remove_list(entity.id),
                Envelope::ListsReordered(order) => state.lists.reorder(&order.ordered_ids),
            }
        }
        self.persist();
    }

    // =========================================================================
    // Optimistic mutations
    // =========================================================================

    /// Applies a local edit and records how to undo it.
    ///
    /// `edit` runs under the lock and must validate before changing anything;
    /// an error leaves the cache untouched.
    fn begin(
        &self,
        kinds: &'static [EntityKind],
        temp_id: Option<EntityId>,
        edit: impl FnOnce(&mut CacheState) -> ClientResult<()>,
    ) -> ClientResult<PendingMutation<'_>> {
        let snapshot = {
            let mut state = self.state.lock();
            let snapshot = Snapshot::capture(&state, kinds);
            edit(&mut *state)?;
            snapshot
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.persist();
        Ok(PendingMutation {
            reconciler: self,
            kinds,
            temp_id,
            snapshot: Some(snapshot),
        })
    }

    /// Settles a mutation: on success `confirm` folds the server result into
    /// the cache; on failure the snapshot is restored. Either way the touched
    /// kinds become stale.
    fn finish<T>(
        &self,
        mut pending: PendingMutation<'_>,
        result: ClientResult<T>,
        confirm: impl FnOnce(&mut CacheState, &T),
    ) -> ClientResult<T> {
        let snapshot = pending.snapshot.take();
        {
            let mut state = self.state.lock();
            match &result {
                Ok(value) => confirm(&mut *state, value),
                Err(e) => {
                    warn!(
                        kinds = ?pending.kinds,
                        temp_id = ?pending.temp_id,
                        error = %e,
                        "mutation failed, rolling back"
                    );
                    if let Some(snapshot) = snapshot {
                        snapshot.restore(&mut *state);
                    }
                }
            }
        }
        self.release(pending.kinds);
        result
    }

    /// Ends a mutation: frees its in-flight slot and marks its kinds stale.
    fn release(&self, kinds: &[EntityKind]) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.mark_stale(kinds);
        self.persist();
    }

    fn persist(&self) {
        if let Some(writer) = &self.persist {
            writer.submit(self.tasks());
        }
    }

    /// Blocks until the latest cache snapshot is on disk. A no-op without a
    /// cache file.
    pub fn flush(&self) {
        if let Some(writer) = &self.persist {
            writer.flush();
        }
    }

    /// Creates a task. A provisional entry is visible until the server
    /// answers.
    pub async fn create_task<A: TaskApi + ?Sized>(&self, api: &A, new: NewTask) -> ClientResult<Task> {
        if let Some(list_id) = new.list_id {
            synced(EntityKind::List, list_id)?;
        }
        let temp_id = self.temp_ids.allocate();
        let provisional = new.provisional(temp_id);
        let pending = self.begin(TASKS, Some(temp_id), |state| {
            state.tasks.insert_if_absent(provisional);
            Ok(())
        })?;

        let result = api.create_task(&new).await;
        self.finish(pending, result, |state, task| {
            let (task, subtasks) = detach(task.clone());
            state.tasks.settle(temp_id, task);
            for subtask in subtasks {
                state.subtasks.insert_if_absent(subtask);
            }
        })
    }

    /// Updates a task in place.
    pub async fn update_task<A: TaskApi + ?Sized>(
        &self,
        api: &A,
        id: EntityId,
        patch: TaskPatch,
    ) -> ClientResult<Task> {
        synced(EntityKind::Task, id)?;
        let pending = self.begin(TASKS, None, |state| {
            let task = state.tasks.get_mut(id).ok_or(ClientError::NotFound {
                kind: EntityKind::Task,
                id,
            })?;
            patch.apply(task);
            Ok(())
        })?;

        let result = api.update_task(id, &patch).await;
        // A task deleted while the update was in flight stays deleted.
        self.finish(pending, result, |state, task| {
            state.tasks.replace(detach(task.clone()).0);
        })
    }

    /// Deletes a task and its subtasks.
    pub async fn delete_task<A: TaskApi + ?Sized>(&self, api: &A, id: EntityId) -> ClientResult<()> {
        synced(EntityKind::Task, id)?;
        let pending = self.begin(TASK_TREE, None, |state| {
            require(state.tasks.contains(id), EntityKind::Task, id)?;
            state.remove_task(id);
            Ok(())
        })?;

        let result = api.delete_task(id).await;
        self.finish(pending, result, |state, _| state.remove_task(id))
    }

    /// Reorders tasks.
    pub async fn reorder_tasks<A: TaskApi + ?Sized>(
        &self,
        api: &A,
        ordered_ids: Vec<EntityId>,
    ) -> ClientResult<()> {
        all_synced(EntityKind::Task, &ordered_ids)?;
        let pending = self.begin(TASKS, None, |state| {
            state.tasks.reorder(&ordered_ids);
            Ok(())
        })?;

        let result = api.reorder_tasks(&ordered_ids).await;
        self.finish(pending, result, |_, _| {})
    }

    /// Adds a subtask to a task.
    pub async fn create_subtask<A: TaskApi + ?Sized>(
        &self,
        api: &A,
        task_id: EntityId,
        new: NewSubtask,
    ) -> ClientResult<Subtask> {
        synced(EntityKind::Task, task_id)?;
        let temp_id = self.temp_ids.allocate();
        let pending = self.begin(SUBTASKS, Some(temp_id), |state| {
            require(state.tasks.contains(task_id), EntityKind::Task, task_id)?;
            state.subtasks.insert_if_absent(new.provisional(temp_id, task_id));
            Ok(())
        })?;

        let result = api.create_subtask(task_id, &new).await;
        self.finish(pending, result, |state, subtask| {
            state.subtasks.settle(temp_id, subtask.clone());
        })
    }

    /// Updates a subtask in place.
    pub async fn update_subtask<A: TaskApi + ?Sized>(
        &self,
        api: &A,
        id: EntityId,
        patch: SubtaskPatch,
    ) -> ClientResult<Subtask> {
        synced(EntityKind::Subtask, id)?;
        let pending = self.begin(SUBTASKS, None, |state| {
            let subtask = state.subtasks.get_mut(id).ok_or(ClientError::NotFound {
                kind: EntityKind::Subtask,
                id,
            })?;
            patch.apply(subtask);
            Ok(())
        })?;

        let result = api.update_subtask(id, &patch).await;
        self.finish(pending, result, |state, subtask| {
            state.subtasks.replace(subtask.clone());
        })
    }

    /// Deletes a subtask.
    pub async fn delete_subtask<A: TaskApi + ?Sized>(&self, api: &A, id: EntityId) -> ClientResult<()> {
        synced(EntityKind::Subtask, id)?;
        let pending = self.begin(SUBTASKS, None, |state| {
            state
                .subtasks
                .remove(id)
                .map(|_| ())
                .ok_or(ClientError::NotFound {
                    kind: EntityKind::Subtask,
                    id,
                })
        })?;

        let result = api.delete_subtask(id).await;
        self.finish(pending, result, |state, _| {
            state.subtasks.remove(id);
        })
    }

    /// Reorders the subtasks of one task.
    pub async fn reorder_subtasks<A: TaskApi + ?Sized>(
        &self,
        api: &A,
        task_id: EntityId,
        ordered_ids: Vec<EntityId>,
    ) -> ClientResult<()> {
        synced(EntityKind::Task, task_id)?;
        all_synced(EntityKind::Subtask, &ordered_ids)?;
        let pending = self.begin(SUBTASKS, None, |state| {
            state
                .subtasks
                .reorder_subset(&ordered_ids, |subtask| subtask.task_id == task_id);
            Ok(())
        })?;

        let result = api.reorder_subtasks(task_id, &ordered_ids).await;
        self.finish(pending, result, |_, _| {})
    }

    /// Creates a list.
    pub async fn create_list<A: TaskApi + ?Sized>(&self, api: &A, new: NewList) -> ClientResult<List> {
        let temp_id = self.temp_ids.allocate();
        let pending = self.begin(LISTS, Some(temp_id), |state| {
            state.lists.insert_if_absent(new.provisional(temp_id));
            Ok(())
        })?;

        let result = api.create_list(&new).await;
        self.finish(pending, result, |state, list| {
            state.lists.settle(temp_id, list.clone());
        })
    }

    /// Renames a list.
    pub async fn update_list<A: TaskApi + ?Sized>(
        &self,
        api: &A,
        id: EntityId,
        patch: ListPatch,
    ) -> ClientResult<List> {
        synced(EntityKind::List, id)?;
        let pending = self.begin(LISTS, None, |state| {
            let list = state.lists.get_mut(id).ok_or(ClientError::NotFound {
                kind: EntityKind::List,
                id,
            })?;
            patch.apply(list);
            Ok(())
        })?;

        let result = api.update_list(id, &patch).await;
        self.finish(pending, result, |state, list| {
            state.lists.replace(list.clone());
        })
    }

    /// Deletes a list together with its tasks.
    pub async fn delete_list<A: TaskApi + ?Sized>(&self, api: &A, id: EntityId) -> ClientResult<()> {
        synced(EntityKind::List, id)?;
        let pending = self.begin(EVERYTHING, None, |state| {
            require(state.lists.contains(id), EntityKind::List, id)?;
            state.remove_list(id);
            Ok(())
        })?;

        let result = api.delete_list(id).await;
        self.finish(pending, result, |state, _| state.remove_list(id))
    }

    /// Reorders lists.
    pub async fn reorder_lists<A: TaskApi + ?Sized>(
        &self,
        api: &A,
        ordered_ids: Vec<EntityId>,
    ) -> ClientResult<()> {
        all_synced(EntityKind::List, &ordered_ids)?;
        let pending = self.begin(LISTS, None, |state| {
            state.lists.reorder(&ordered_ids);
            Ok(())
        })?;

        let result = api.reorder_lists(&ordered_ids).await;
        self.finish(pending, result, |_, _| {})
    }
}

impl EnvelopeSink for Reconciler {
    fn deliver(&self, envelope: Envelope) {
        self.apply(envelope);
    }

    fn on_open(&self) {
        // Nothing sent while disconnected is replayed.
        self.mark_stale(&EntityKind::ALL);
    }
}

fn synced(kind: EntityKind, id: EntityId) -> ClientResult<()> {
    if is_temp_id(id) {
        return Err(ClientError::NotSynced { kind, id });
    }
    Ok(())
}

fn all_synced(kind: EntityKind, ids: &[EntityId]) -> ClientResult<()> {
    ids.iter().try_for_each(|&id| synced(kind, id))
}

fn require(present: bool, kind: EntityKind, id: EntityId) -> ClientResult<()> {
    if !present {
        return Err(ClientError::NotFound { kind, id });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicI64};
    use std::sync::Arc;

    /// In-process server double. Assigns ids from 42 upwards and can echo
    /// creates to a reconciler before answering, like a broadcast racing
    /// ahead of the REST response.
    struct FakeApi {
        next_id: AtomicI64,
        fail: AtomicBool,
        echo_first: Mutex<Option<Arc<Reconciler>>>,
        tasks: Mutex<Vec<Task>>,
        lists: Mutex<Vec<List>>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                next_id: AtomicI64::new(42),
                fail: AtomicBool::new(false),
                echo_first: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                lists: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            let api = Self::new();
            api.fail.store(true, Ordering::SeqCst);
            api
        }

        fn check(&self) -> ClientResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::Mutation {
                    status: 400,
                    message: "rejected".into(),
                });
            }
            Ok(())
        }

        fn echo(&self, envelope: Envelope) {
            if let Some(reconciler) = self.echo_first.lock().clone() {
                reconciler.apply(envelope);
            }
        }
    }

    #[async_trait]
    impl TaskApi for FakeApi {
        async fn tasks(&self) -> ClientResult<Vec<Task>> {
            self.check()?;
            Ok(self.tasks.lock().clone())
        }

        async fn create_task(&self, new: &NewTask) -> ClientResult<Task> {
            self.check()?;
            let mut task = new.provisional(self.next_id.fetch_add(1, Ordering::SeqCst));
            task.user_id = 7;
            self.echo(Envelope::TaskCreated(task.clone()));
            Ok(task)
        }

        async fn update_task(&self, id: EntityId, patch: &TaskPatch) -> ClientResult<Task> {
            self.check()?;
            let mut task = NewTask::new("server copy").provisional(id);
            patch.apply(&mut task);
            Ok(task)
        }

        async fn delete_task(&self, _id: EntityId) -> ClientResult<()> {
            self.check()
        }

        async fn reorder_tasks(&self, _ids: &[EntityId]) -> ClientResult<()> {
            self.check()
        }

        async fn create_subtask(&self, task_id: EntityId, new: &NewSubtask) -> ClientResult<Subtask> {
            self.check()?;
            let subtask = new.provisional(self.next_id.fetch_add(1, Ordering::SeqCst), task_id);
            self.echo(Envelope::SubtaskCreated(subtask.clone()));
            Ok(subtask)
        }

        async fn update_subtask(&self, id: EntityId, patch: &SubtaskPatch) -> ClientResult<Subtask> {
            self.check()?;
            let mut subtask = NewSubtask::default().provisional(id, 1);
            patch.apply(&mut subtask);
            Ok(subtask)
        }

        async fn delete_subtask(&self, _id: EntityId) -> ClientResult<()> {
            self.check()
        }

        async fn reorder_subtasks(&self, _task_id: EntityId, _ids: &[EntityId]) -> ClientResult<()> {
            self.check()
        }

        async fn lists(&self) -> ClientResult<Vec<List>> {
            self.check()?;
            Ok(self.lists.lock().clone())
        }

        async fn create_list(&self, new: &NewList) -> ClientResult<List> {
            self.check()?;
            let list = new.provisional(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.echo(Envelope::ListCreated(list.clone()));
            Ok(list)
        }

        async fn update_list(&self, id: EntityId, patch: &ListPatch) -> ClientResult<List> {
            self.check()?;
            let mut list = NewList::default().provisional(id);
            patch.apply(&mut list);
            Ok(list)
        }

        async fn delete_list(&self, _id: EntityId) -> ClientResult<()> {
            self.check()
        }

        async fn reorder_lists(&self, _ids: &[EntityId]) -> ClientResult<()> {
            self.check()
        }
    }

    fn task(id: EntityId, list_id: Option<EntityId>) -> Task {
        let mut task = NewTask::new(format!("task {id}")).provisional(id);
        task.list_id = list_id;
        task
    }

    fn subtask(id: EntityId, task_id: EntityId) -> Subtask {
        NewSubtask {
            text: format!("subtask {id}"),
        }
        .provisional(id, task_id)
    }

    fn list(id: EntityId) -> List {
        NewList {
            title: format!("list {id}"),
        }
        .provisional(id)
    }

    fn ids(tasks: &[Task]) -> Vec<EntityId> {
        tasks.iter().map(|t| t.id).collect()
    }

    fn seeded() -> Reconciler {
        let reconciler = Reconciler::new();
        let mut first = task(1, Some(10));
        first.subtasks = vec![subtask(100, 1), subtask(101, 1)];
        reconciler.hydrate(
            vec![first, task(2, Some(11)), task(3, Some(10)), task(4, None)],
            vec![list(10), list(11)],
        );
        reconciler
    }

    #[tokio::test]
    async fn buy_milk_under_errand_filter() {
        let reconciler = Reconciler::new();
        let api = FakeApi::new();
        let draft = NewTask::parse("Buy milk #errand", Some("errand"));

        let created = reconciler.create_task(&api, draft).await.unwrap();
        assert_eq!(created.id, 42);

        let tasks = reconciler.tasks();
        assert_eq!(ids(&tasks), vec![42]);
        assert_eq!(tasks[0].text, "Buy milk");
        assert_eq!(tasks[0].tags, vec!["errand".to_string()]);
        assert!(reconciler.is_stale(EntityKind::Task));
        assert_eq!(reconciler.in_flight(), 0);

        // The broadcast of the same create arriving late is a no-op.
        reconciler.apply(Envelope::TaskCreated(created));
        assert_eq!(ids(&reconciler.tasks()), vec![42]);
    }

    #[tokio::test]
    async fn broadcast_before_response_leaves_one_entity() {
        let reconciler = Arc::new(seeded());
        let api = FakeApi::new();
        *api.echo_first.lock() = Some(Arc::clone(&reconciler));

        let draft = NewTask::parse("Buy milk #errand", Some("errand"));
        reconciler.create_task(&api, draft).await.unwrap();

        let tasks = reconciler.tasks();
        assert_eq!(tasks.iter().filter(|t| t.id == 42).count(), 1);
        assert!(tasks.iter().all(|t| !is_temp_id(t.id)));
        assert_eq!(ids(&tasks), vec![1, 2, 3, 4, 42]);
    }

    #[tokio::test]
    async fn provisional_entry_is_visible_before_response() {
        let reconciler = Arc::new(Reconciler::new());
        let api = Arc::new(FakeApi::new());

        // Observe the cache from inside the request.
        struct Peek {
            inner: Arc<FakeApi>,
            seen: Mutex<Vec<Vec<Task>>>,
            reconciler: Arc<Reconciler>,
        }

        #[async_trait]
        impl TaskApi for Peek {
            async fn tasks(&self) -> ClientResult<Vec<Task>> {
                self.inner.tasks().await
            }
            async fn create_task(&self, new: &NewTask) -> ClientResult<Task> {
                self.seen.lock().push(self.reconciler.tasks());
                self.inner.create_task(new).await
            }
            async fn update_task(&self, id: EntityId, patch: &TaskPatch) -> ClientResult<Task> {
                self.inner.update_task(id, patch).await
            }
            async fn delete_task(&self, id: EntityId) -> ClientResult<()> {
                self.inner.delete_task(id).await
            }
            async fn reorder_tasks(&self, ids: &[EntityId]) -> ClientResult<()> {
                self.inner.reorder_tasks(ids).await
            }
            async fn create_subtask(&self, task_id: EntityId, new: &NewSubtask) -> ClientResult<Subtask> {
                self.inner.create_subtask(task_id, new).await
            }
            async fn update_subtask(&self, id: EntityId, patch: &SubtaskPatch) -> ClientResult<Subtask> {
                self.inner.update_subtask(id, patch).await
            }
            async fn delete_subtask(&self, id: EntityId) -> ClientResult<()> {
                self.inner.delete_subtask(id).await
            }
            async fn reorder_subtasks(&self, task_id: EntityId, ids: &[EntityId]) -> ClientResult<()> {
                self.inner.reorder_subtasks(task_id, ids).await
            }
            async fn lists(&self) -> ClientResult<Vec<List>> {
                self.inner.lists().await
            }
            async fn create_list(&self, new: &NewList) -> ClientResult<List> {
                self.inner.create_list(new).await
            }
            async fn update_list(&self, id: EntityId, patch: &ListPatch) -> ClientResult<List> {
                self.inner.update_list(id, patch).await
            }
            async fn delete_list(&self, id: EntityId) -> ClientResult<()> {
                self.inner.delete_list(id).await
            }
            async fn reorder_lists(&self, ids: &[EntityId]) -> ClientResult<()> {
                self.inner.reorder_lists(ids).await
            }
        }

        let peek = Peek {
            inner: api,
            seen: Mutex::new(Vec::new()),
            reconciler: Arc::clone(&reconciler),
        };
        reconciler
            .create_task(&peek, NewTask::parse("Buy milk #errand", Some("errand")))
            .await
            .unwrap();

        let seen = peek.seen.lock();
        assert_eq!(seen[0].len(), 1);
        assert!(is_temp_id(seen[0][0].id));
        assert_eq!(seen[0][0].tags, vec!["errand".to_string()]);
        assert_eq!(reconciler.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_mutations_roll_back_exactly() {
        let api = FakeApi::failing();
        let reconciler = seeded();
        let before = reconciler.snapshot();

        assert!(reconciler.create_task(&api, NewTask::new("nope")).await.is_err());
        assert_eq!(reconciler.snapshot(), before);

        let patch = TaskPatch {
            completed: Some(true),
            ..TaskPatch::default()
        };
        assert!(reconciler.update_task(&api, 1, patch).await.is_err());
        assert_eq!(reconciler.snapshot(), before);

        assert!(reconciler.delete_task(&api, 1).await.is_err());
        assert_eq!(reconciler.snapshot(), before);

        assert!(reconciler.reorder_tasks(&api, vec![4, 3]).await.is_err());
        assert_eq!(reconciler.snapshot(), before);

        assert!(reconciler.delete_list(&api, 10).await.is_err());
        assert_eq!(reconciler.snapshot(), before);

        assert!(reconciler
            .reorder_subtasks(&api, 1, vec![101, 100])
            .await
            .is_err());
        assert_eq!(reconciler.snapshot(), before);

        assert!(reconciler.is_stale(EntityKind::List));
        assert_eq!(reconciler.in_flight(), 0);
    }

    #[tokio::test]
    async fn update_replaces_in_place() {
        let api = FakeApi::new();
        let reconciler = seeded();
        let patch = TaskPatch {
            important: Some(true),
            ..TaskPatch::default()
        };
        let updated = reconciler.update_task(&api, 2, patch).await.unwrap();
        assert!(updated.important);

        let tasks = reconciler.tasks();
        assert_eq!(ids(&tasks), vec![1, 2, 3, 4]);
        assert_eq!(tasks[1].text, "server copy");
    }

    #[tokio::test]
    async fn provisional_targets_are_rejected() {
        let api = FakeApi::new();
        let reconciler = seeded();
        assert!(matches!(
            reconciler.delete_task(&api, -3).await,
            Err(ClientError::NotSynced { kind: EntityKind::Task, id: -3 })
        ));
        assert!(matches!(
            reconciler.update_task(&api, 99, TaskPatch::default()).await,
            Err(ClientError::NotFound { .. })
        ));
        assert_eq!(reconciler.in_flight(), 0);
    }

    #[test]
    fn list_deleted_cascades_to_tasks() {
        let reconciler = seeded();
        reconciler.apply(Envelope::deleted(EntityKind::List, 10));

        assert_eq!(ids(&reconciler.tasks()), vec![2, 4]);
        assert!(reconciler.subtasks_of(1).is_empty());
        assert_eq!(reconciler.lists().len(), 1);
    }

    #[test]
    fn task_deleted_cascades_to_subtasks() {
        let reconciler = seeded();
        reconciler.apply(Envelope::deleted(EntityKind::Task, 1));
        assert!(reconciler.snapshot().subtasks.is_empty());
    }

    #[test]
    fn reorder_envelope_appends_unmentioned() {
        let reconciler = seeded();
        let envelope = Envelope::reordered(EntityKind::Task, vec![3, 1]);
        reconciler.apply(envelope.clone());
        assert_eq!(ids(&reconciler.tasks()), vec![3, 1, 2, 4]);

        reconciler.apply(envelope);
        assert_eq!(ids(&reconciler.tasks()), vec![3, 1, 2, 4]);
    }

    #[test]
    fn subtask_reorder_stays_within_task() {
        let reconciler = seeded();
        reconciler.apply(Envelope::SubtaskCreated(subtask(200, 2)));
        reconciler.apply(Envelope::reordered(EntityKind::Subtask, vec![101]));

        let order: Vec<EntityId> = reconciler.subtasks_of(1).iter().map(|s| s.id).collect();
        assert_eq!(order, vec![101, 100]);
        assert_eq!(reconciler.subtasks_of(2)[0].sort_order, 0);
    }

    #[test]
    fn envelopes_apply_in_arrival_order() {
        let reconciler = Reconciler::new();
        let mut renamed = task(5, None);
        renamed.text = "renamed".into();

        // Update before create is dropped: updates never insert.
        reconciler.apply(Envelope::TaskUpdated(renamed.clone()));
        reconciler.apply(Envelope::TaskCreated(task(5, None)));
        assert_eq!(reconciler.task(5).unwrap().text, "task 5");

        reconciler.apply(Envelope::TaskUpdated(renamed));
        reconciler.apply(Envelope::TaskCreated(task(5, None)));
        assert_eq!(reconciler.task(5).unwrap().text, "renamed");
    }

    #[tokio::test]
    async fn subtask_and_list_creates_settle() {
        let api = FakeApi::new();
        let reconciler = seeded();

        let subtask = reconciler
            .create_subtask(&api, 2, NewSubtask { text: "milk".into() })
            .await
            .unwrap();
        assert_eq!(reconciler.subtasks_of(2), vec![subtask]);

        let list = reconciler
            .create_list(&api, NewList { title: "Home".into() })
            .await
            .unwrap();
        assert_eq!(reconciler.lists().last().map(|l| l.id), Some(list.id));
        assert_eq!(reconciler.lists().len(), 3);
    }

    #[tokio::test]
    async fn refetch_keeps_pending_entries() {
        let api = FakeApi::new();
        api.tasks.lock().push(task(9, None));
        api.lists.lock().push(list(20));

        let reconciler = seeded();
        reconciler.apply(Envelope::TaskCreated(task(-7, None)));
        reconciler.on_open();

        reconciler.refetch(&api).await.unwrap();
        assert_eq!(ids(&reconciler.tasks()), vec![9, -7]);
        assert_eq!(reconciler.lists().len(), 1);
        assert!(reconciler.take_stale().is_empty());
    }

    #[tokio::test]
    async fn failed_refetch_stays_stale() {
        let api = FakeApi::failing();
        let reconciler = seeded();
        reconciler.mark_stale(&[EntityKind::List]);

        assert!(reconciler.refetch(&api).await.is_err());
        assert!(reconciler.is_stale(EntityKind::List));
        assert_eq!(reconciler.lists().len(), 2);
    }

    /// Never answers.
    struct HangingApi;

    #[async_trait]
    impl TaskApi for HangingApi {
        async fn tasks(&self) -> ClientResult<Vec<Task>> {
            Ok(Vec::new())
        }
        async fn create_task(&self, _new: &NewTask) -> ClientResult<Task> {
            futures::future::pending().await
        }
        async fn update_task(&self, _id: EntityId, _patch: &TaskPatch) -> ClientResult<Task> {
            futures::future::pending().await
        }
        async fn delete_task(&self, _id: EntityId) -> ClientResult<()> {
            futures::future::pending().await
        }
        async fn reorder_tasks(&self, _ids: &[EntityId]) -> ClientResult<()> {
            futures::future::pending().await
        }
        async fn create_subtask(&self, _task_id: EntityId, _new: &NewSubtask) -> ClientResult<Subtask> {
            futures::future::pending().await
        }
        async fn update_subtask(&self, _id: EntityId, _patch: &SubtaskPatch) -> ClientResult<Subtask> {
            futures::future::pending().await
        }
        async fn delete_subtask(&self, _id: EntityId) -> ClientResult<()> {
            futures::future::pending().await
        }
        async fn reorder_subtasks(&self, _task_id: EntityId, _ids: &[EntityId]) -> ClientResult<()> {
            futures::future::pending().await
        }
        async fn lists(&self) -> ClientResult<Vec<List>> {
            Ok(Vec::new())
        }
        async fn create_list(&self, _new: &NewList) -> ClientResult<List> {
            futures::future::pending().await
        }
        async fn update_list(&self, _id: EntityId, _patch: &ListPatch) -> ClientResult<List> {
            futures::future::pending().await
        }
        async fn delete_list(&self, _id: EntityId) -> ClientResult<()> {
            futures::future::pending().await
        }
        async fn reorder_lists(&self, _ids: &[EntityId]) -> ClientResult<()> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn abandoned_mutations_roll_back() {
        let reconciler = seeded();
        let before = reconciler.snapshot();
        let timeout = std::time::Duration::from_millis(20);

        let create = reconciler.create_task(&HangingApi, NewTask::new("never answered"));
        assert!(tokio::time::timeout(timeout, create).await.is_err());
        assert_eq!(reconciler.snapshot(), before);
        assert_eq!(reconciler.in_flight(), 0);

        let delete = reconciler.delete_list(&HangingApi, 10);
        assert!(tokio::time::timeout(timeout, delete).await.is_err());
        assert_eq!(reconciler.snapshot(), before);
        assert_eq!(reconciler.in_flight(), 0);

        // Nothing provisional is left for a refetch to carry over.
        reconciler.mark_stale(&[EntityKind::Task]);
        reconciler.refetch(&HangingApi).await.unwrap();
        assert!(reconciler.tasks().is_empty());
        assert_eq!(reconciler.in_flight(), 0);
    }

    #[tokio::test]
    async fn cache_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let api = FakeApi::new();

        {
            let reconciler = Reconciler::with_cache_file(CacheFile::new(&path)).unwrap();
            reconciler.hydrate(vec![task(1, None)], vec![list(10)]);
            reconciler
                .create_task(&api, NewTask::new("persisted"))
                .await
                .unwrap();
            reconciler.flush();
        }

        let restored = Reconciler::with_cache_file(CacheFile::new(&path)).unwrap();
        assert_eq!(ids(&restored.tasks()), vec![1, 42]);
        assert!(restored.lists().is_empty());
        assert!(restored.is_stale(EntityKind::List));
    }
}
