//! Change notifications for committed writes.
//!
//! Request handlers call the [`Broadcaster`] after the repository returns a
//! [`Committed`] value. Emission is fire-and-forget: delivery problems are the
//! hub's concern and never turn a successful write into a failed response.
//!
//! A write and its announcement run inside [`Broadcaster::sequenced`], which
//! holds a per-user lock across both. Two concurrent writes by one user
//! therefore reach that user's sockets in the order they committed.

use crate::error::ServerResult;
use crate::hub::{Hub, PublishReport, UserId};
use crate::store::Committed;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tasksync_protocol::{Entity, EntityId, EntityKind, Envelope};
use tracing::debug;

/// Publishes change envelopes to every connection of the acting user.
#[derive(Clone)]
pub struct Broadcaster {
    hub: Arc<Hub>,
    sequence: Arc<Mutex<HashMap<UserId, Arc<Mutex<()>>>>>,
}

impl Broadcaster {
    /// Creates a broadcaster over a hub.
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            sequence: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `write` while holding `user`'s sequencing lock. `write` commits
    /// through the repository and announces the result through the
    /// broadcaster it is handed.
    pub fn sequenced<T>(
        &self,
        user: UserId,
        write: impl FnOnce(&Self) -> ServerResult<T>,
    ) -> ServerResult<T> {
        let lock = Arc::clone(self.sequence.lock().entry(user).or_default());
        let result = {
            let _turn = lock.lock();
            write(self)
        };

        // Whoever still holds a clone will come through here after us, so the
        // last one out drops the entry.
        let mut sequence = self.sequence.lock();
        let idle = Arc::strong_count(&lock) == 2;
        drop(lock);
        if idle {
            sequence.remove(&user);
        }
        result
    }

    /// Announces a created entity.
    pub fn created<E: Entity>(&self, user: UserId, entity: &Committed<E>) -> PublishReport {
        self.emit(user, (**entity).clone().into_created())
    }

    /// Announces an updated entity.
    pub fn updated<E: Entity>(&self, user: UserId, entity: &Committed<E>) -> PublishReport {
        self.emit(user, (**entity).clone().into_updated())
    }

    /// Announces a deletion.
    pub fn deleted(&self, user: UserId, kind: EntityKind, id: &Committed<EntityId>) -> PublishReport {
        self.emit(user, Envelope::deleted(kind, **id))
    }

    /// Announces a new order.
    pub fn reordered(
        &self,
        user: UserId,
        kind: EntityKind,
        ids: &Committed<Vec<EntityId>>,
    ) -> PublishReport {
        self.emit(user, Envelope::reordered(kind, ids.to_vec()))
    }

    fn emit(&self, user: UserId, envelope: Envelope) -> PublishReport {
        let report = self.hub.publish(user, &envelope);
        debug!(
            user,
            event = envelope.type_name(),
            delivered = report.delivered,
            evicted = report.evicted,
            "broadcast"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Repository};
    use tasksync_protocol::{NewTask, TaskPatch};

    #[test]
    fn created_reaches_only_the_author() {
        let hub = Arc::new(Hub::new(8));
        let broadcaster = Broadcaster::new(Arc::clone(&hub));
        let (mut mine, _) = hub.connect(1).into_parts();
        let (mut theirs, _) = hub.connect(2).into_parts();

        let store = MemoryStore::new();
        let task = store.create_task(1, NewTask::new("Buy milk")).unwrap();
        let report = broadcaster.created(1, &task);

        assert_eq!(report.delivered, 1);
        let message = mine.try_recv().unwrap();
        match Envelope::from_json(&message).unwrap() {
            Envelope::TaskCreated(sent) => assert_eq!(sent, *task),
            other => panic!("unexpected envelope {other:?}"),
        }
        assert!(theirs.try_recv().is_err());
    }

    #[test]
    fn concurrent_updates_are_announced_in_commit_order() {
        let hub = Arc::new(Hub::new(1024));
        let broadcaster = Broadcaster::new(Arc::clone(&hub));
        let store = Arc::new(MemoryStore::new());
        let (mut rx, _) = hub.connect(1).into_parts();
        let id = store.create_task(1, NewTask::new("start")).unwrap().id;

        let writers: Vec<_> = (0..8)
            .map(|writer| {
                let broadcaster = broadcaster.clone();
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        let patch = TaskPatch {
                            text: Some(format!("{writer}-{n}")),
                            ..TaskPatch::default()
                        };
                        broadcaster
                            .sequenced(1, |emitter| {
                                let task = store.update_task(1, id, &patch)?;
                                emitter.updated(1, &task);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut last = None;
        let mut received = 0;
        while let Ok(message) = rx.try_recv() {
            received += 1;
            last = Some(Envelope::from_json(&message).unwrap());
        }
        assert_eq!(received, 400);
        match last {
            Some(Envelope::TaskUpdated(task)) => {
                assert_eq!(task.text, store.task(1, id).unwrap().text);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(broadcaster.sequence.lock().is_empty());
    }

    #[test]
    fn failed_write_is_not_announced() {
        let hub = Arc::new(Hub::new(8));
        let broadcaster = Broadcaster::new(Arc::clone(&hub));
        let store = MemoryStore::new();
        let (mut rx, _) = hub.connect(1).into_parts();

        let result = broadcaster.sequenced(1, |emitter| {
            let task = store.update_task(1, 99, &TaskPatch::default())?;
            emitter.updated(1, &task);
            Ok(())
        });
        assert!(result.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn deleted_and_reordered_payloads() {
        let hub = Arc::new(Hub::new(8));
        let broadcaster = Broadcaster::new(Arc::clone(&hub));
        let (mut rx, _) = hub.connect(5).into_parts();

        broadcaster.deleted(5, EntityKind::List, &Committed::new(4));
        broadcaster.reordered(5, EntityKind::Subtask, &Committed::new(vec![3, 1]));

        assert_eq!(
            Envelope::from_json(&rx.try_recv().unwrap()).unwrap(),
            Envelope::deleted(EntityKind::List, 4)
        );
        assert_eq!(
            Envelope::from_json(&rx.try_recv().unwrap()).unwrap(),
            Envelope::reordered(EntityKind::Subtask, vec![3, 1])
        );
    }
}
