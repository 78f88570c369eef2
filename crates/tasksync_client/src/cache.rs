//! Ordered entity collections backing the reconciler.

use std::sync::atomic::{AtomicI64, Ordering};
use tasksync_protocol::{Entity, EntityId};

/// An ordered collection of entities with unique ids.
///
/// Order is display order; `sort_order` fields are rewritten whenever the
/// collection is reordered.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection<E: Entity> {
    items: Vec<E>,
}

impl<E: Entity> Default for Collection<E> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<E: Entity> Collection<E> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from entities in display order. Later duplicates
    /// of an id are dropped.
    pub fn from_vec(items: Vec<E>) -> Self {
        let mut collection = Self::new();
        for item in items {
            collection.insert_if_absent(item);
        }
        collection
    }

    /// Returns the number of entities.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates in display order.
    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.items.iter()
    }

    /// Returns the entities in display order.
    pub fn as_slice(&self) -> &[E] {
        &self.items
    }

    /// Consumes the collection.
    pub fn into_vec(self) -> Vec<E> {
        self.items
    }

    /// Returns the ids in display order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.items.iter().map(Entity::id).collect()
    }

    /// Looks up an entity by id.
    pub fn get(&self, id: EntityId) -> Option<&E> {
        self.items.iter().find(|item| item.id() == id)
    }

    /// Looks up an entity by id for modification.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut E> {
        self.items.iter_mut().find(|item| item.id() == id)
    }

    /// Returns true if an entity with `id` is present.
    pub fn contains(&self, id: EntityId) -> bool {
        self.position(id).is_some()
    }

    /// Returns the index of `id`.
    pub fn position(&self, id: EntityId) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    /// Appends `entity` unless its id is already present.
    ///
    /// Returns true if the entity was added.
    pub fn insert_if_absent(&mut self, entity: E) -> bool {
        if self.contains(entity.id()) {
            return false;
        }
        self.items.push(entity);
        true
    }

    /// Replaces the entity with the same id, keeping its position.
    ///
    /// Returns false if no such entity exists; nothing is inserted.
    pub fn replace(&mut self, entity: E) -> bool {
        match self.get_mut(entity.id()) {
            Some(slot) => {
                *slot = entity;
                true
            }
            None => false,
        }
    }

    /// Removes an entity by id.
    pub fn remove(&mut self, id: EntityId) -> Option<E> {
        self.position(id).map(|index| self.items.remove(index))
    }

    /// Keeps only entities matching `keep`. Returns the number removed.
    pub fn retain(&mut self, keep: impl FnMut(&E) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(keep);
        before - self.items.len()
    }

    /// Replaces a provisional entry with its confirmed version.
    ///
    /// Both `temp_id` and the confirmed id are removed first, so a copy that
    /// was already inserted under the confirmed id (by a pushed envelope) is
    /// never duplicated. The confirmed entity takes the provisional entry's
    /// slot, falling back to the existing copy's slot, then to the end.
    pub fn settle(&mut self, temp_id: EntityId, confirmed: E) {
        let slot = self
            .position(temp_id)
            .or_else(|| self.position(confirmed.id()));
        let confirmed_id = confirmed.id();
        let stale = |item: &E| item.id() == temp_id || item.id() == confirmed_id;
        let shift = slot.map_or(0, |slot| {
            self.items[..slot].iter().filter(|&i| stale(i)).count()
        });
        self.items.retain(|item| !stale(item));
        let index = slot.map_or(self.items.len(), |slot| slot - shift);
        self.items.insert(index, confirmed);
    }

    /// Reorders the whole collection.
    ///
    /// Entities named in `ordered_ids` come first, in that order; the rest
    /// follow in their previous relative order. Unknown ids are ignored.
    pub fn reorder(&mut self, ordered_ids: &[EntityId]) {
        self.reorder_subset(ordered_ids, |_| true);
    }

    /// Reorders only the entities matching `belongs`, leaving every other
    /// entity in its slot.
    ///
    /// Within the group, entities named in `ordered_ids` come first and the
    /// rest follow in their previous relative order. Group members get
    /// `sort_order` equal to their index within the group.
    pub fn reorder_subset(&mut self, ordered_ids: &[EntityId], belongs: impl Fn(&E) -> bool) {
        let slots: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| belongs(item))
            .map(|(index, _)| index)
            .collect();

        let mut group: Vec<E> = slots.iter().map(|&index| self.items[index].clone()).collect();
        let rank = |id: EntityId| ordered_ids.iter().position(|&ordered| ordered == id);
        // Stable: unmentioned entities keep their relative order.
        group.sort_by_key(|item| rank(item.id()).unwrap_or(usize::MAX));

        for (position, (slot, mut item)) in slots.into_iter().zip(group).enumerate() {
            item.set_sort_order(i32::try_from(position).unwrap_or(i32::MAX));
            self.items[slot] = item;
        }
    }
}

impl<'a, E: Entity> IntoIterator for &'a Collection<E> {
    type Item = &'a E;
    type IntoIter = std::slice::Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Allocates provisional ids from the negative range, which server-assigned
/// ids never enter.
#[derive(Debug)]
pub struct TempIds {
    next: AtomicI64,
}

impl Default for TempIds {
    fn default() -> Self {
        Self::new()
    }
}

impl TempIds {
    /// Creates an allocator starting at `-1`.
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(-1),
        }
    }

    /// Returns a fresh provisional id.
    pub fn allocate(&self) -> EntityId {
        self.next.fetch_sub(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use tasksync_protocol::{is_temp_id, List};

    fn list(id: EntityId) -> List {
        let now = Utc::now();
        List {
            id,
            user_id: 1,
            title: format!("list {id}"),
            sort_order: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn lists(ids: &[EntityId]) -> Collection<List> {
        Collection::from_vec(ids.iter().copied().map(list).collect())
    }

    #[test]
    fn from_vec_drops_duplicates() {
        let collection = Collection::from_vec(vec![list(1), list(2), list(1)]);
        assert_eq!(collection.ids(), vec![1, 2]);
    }

    #[test]
    fn insert_if_absent_is_conditional() {
        let mut collection = lists(&[1]);
        let mut renamed = list(1);
        renamed.title = "renamed".into();
        assert!(!collection.insert_if_absent(renamed));
        assert_eq!(collection.get(1).unwrap().title, "list 1");
        assert!(collection.insert_if_absent(list(2)));
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn replace_never_inserts() {
        let mut collection = lists(&[1, 2]);
        let mut renamed = list(2);
        renamed.title = "renamed".into();
        assert!(collection.replace(renamed));
        assert_eq!(collection.ids(), vec![1, 2]);
        assert_eq!(collection.get(2).unwrap().title, "renamed");
        assert!(!collection.replace(list(9)));
        assert!(!collection.contains(9));
    }

    #[test]
    fn settle_takes_provisional_slot() {
        let mut collection = lists(&[1, -1, 2]);
        collection.settle(-1, list(42));
        assert_eq!(collection.ids(), vec![1, 42, 2]);
    }

    #[test]
    fn settle_removes_copy_under_confirmed_id() {
        // The pushed envelope landed before the REST response.
        let mut collection = lists(&[-1, 1, 42]);
        collection.settle(-1, list(42));
        assert_eq!(collection.ids(), vec![42, 1]);
    }

    #[test]
    fn settle_accounts_for_removed_copy_before_slot() {
        let mut collection = lists(&[42, 1, -1, 2]);
        collection.settle(-1, list(42));
        assert_eq!(collection.ids(), vec![1, 42, 2]);
    }

    #[test]
    fn settle_without_provisional_entry() {
        let mut collection = lists(&[1, 42, 2]);
        collection.settle(-5, list(42));
        assert_eq!(collection.ids(), vec![1, 42, 2]);

        let mut collection = lists(&[1]);
        collection.settle(-5, list(42));
        assert_eq!(collection.ids(), vec![1, 42]);
    }

    #[test]
    fn reorder_appends_unmentioned() {
        let mut collection = lists(&[1, 2, 3, 4, 5]);
        collection.reorder(&[4, 2]);
        assert_eq!(collection.ids(), vec![4, 2, 1, 3, 5]);
        let orders: Vec<i32> = collection.iter().map(|l| l.sort_order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reorder_ignores_unknown_ids() {
        let mut collection = lists(&[1, 2]);
        collection.reorder(&[7, 2]);
        assert_eq!(collection.ids(), vec![2, 1]);
    }

    #[test]
    fn reorder_subset_keeps_other_slots() {
        // Odd ids form the group; even ids must not move.
        let mut collection = lists(&[1, 2, 3, 4, 5]);
        collection.reorder_subset(&[5, 1], |l| l.id % 2 == 1);
        assert_eq!(collection.ids(), vec![5, 2, 1, 4, 3]);
        assert_eq!(collection.get(3).unwrap().sort_order, 2);
        assert_eq!(collection.get(2).unwrap().sort_order, 0);
    }

    #[test]
    fn temp_ids_are_unique_and_negative() {
        let ids = TempIds::new();
        let first = ids.allocate();
        let second = ids.allocate();
        assert!(is_temp_id(first) && is_temp_id(second));
        assert_ne!(first, second);
    }

    proptest! {
        #[test]
        fn reorder_is_idempotent_and_preserves_rest(
            len in 1usize..24,
            picks in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let ids: Vec<EntityId> = (1..=len as EntityId).collect();
            let mut mentioned: Vec<EntityId> = Vec::new();
            for pick in &picks {
                let id = ids[pick.index(ids.len())];
                if !mentioned.contains(&id) {
                    mentioned.push(id);
                }
            }

            let mut collection = lists(&ids);
            collection.reorder(&mentioned);
            let once = collection.clone();
            collection.reorder(&mentioned);
            prop_assert_eq!(&collection, &once);

            let order = once.ids();
            prop_assert_eq!(order.len(), ids.len());
            prop_assert_eq!(&order[..mentioned.len()], &mentioned[..]);
            let rest: Vec<EntityId> = ids.iter().copied().filter(|id| !mentioned.contains(id)).collect();
            prop_assert_eq!(&order[mentioned.len()..], &rest[..]);
        }
    }
}
