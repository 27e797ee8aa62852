//! Object tables
//!
//! Fixed-capacity arenas for kernel objects. Capacity comes from the
//! configuration; allocation past it fails with [`Status::TooMany`] instead
//! of growing. Slots are reused through a free list and carry a generation
//! counter that is folded into the object id.

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::error::{Result, Status};
use crate::types::{ObjectId, TypedId};

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

impl<T> Slot<T> {
    fn generation(&self) -> u32 {
        match self {
            Slot::Occupied { generation, .. } | Slot::Vacant { generation } => *generation,
        }
    }
}

/// Arena of objects addressed by typed ids
#[derive(Debug)]
pub struct ObjectTable<I: TypedId, T> {
    slots: Vec<Slot<T>>,
    /// Indices of vacant slots, most recently freed last
    free: Vec<u32>,
    maximum: usize,
    count: usize,
    _id: PhantomData<I>,
}

impl<I: TypedId, T> ObjectTable<I, T> {
    /// Create a table holding at most `maximum` objects
    pub fn new(maximum: usize) -> Self {
        Self {
            slots: Vec::with_capacity(maximum),
            free: Vec::new(),
            maximum,
            count: 0,
            _id: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Configured capacity
    pub fn maximum(&self) -> usize {
        self.maximum
    }

    /// Allocate a slot and build the object from its id
    pub fn allocate_with<F>(&mut self, build: F) -> Result<I>
    where
        F: FnOnce(I) -> T,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.maximum => {
                self.slots.push(Slot::Vacant { generation: 1 });
                (self.slots.len() - 1) as u32
            }
            None => return Err(Status::TooMany),
        };
        let generation = self.slots[index as usize].generation();

        let id = I::from_object_id(ObjectId::new(I::CLASS, index, generation));
        self.slots[index as usize] = Slot::Occupied {
            generation,
            value: build(id),
        };
        self.count += 1;
        Ok(id)
    }

    /// Allocate a slot for `value`
    pub fn allocate(&mut self, value: T) -> Result<I> {
        self.allocate_with(|_| value)
    }

    fn slot_matches(&self, id: I) -> bool {
        let raw = id.object_id();
        raw.class() == I::CLASS
            && matches!(
                self.slots.get(raw.index() as usize),
                Some(Slot::Occupied { generation, .. }) if *generation == raw.generation()
            )
    }

    /// Resolve an id
    pub fn get(&self, id: I) -> Option<&T> {
        if !self.slot_matches(id) {
            return None;
        }
        self.by_index(id.index())
    }

    /// Resolve an id mutably
    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        if !self.slot_matches(id) {
            return None;
        }
        self.by_index_mut(id.index())
    }

    /// Resolve an id or fail with `InvalidId`
    pub fn lookup(&self, id: I) -> Result<&T> {
        self.get(id).ok_or(Status::InvalidId)
    }

    /// Resolve an id mutably or fail with `InvalidId`
    pub fn lookup_mut(&mut self, id: I) -> Result<&mut T> {
        self.get_mut(id).ok_or(Status::InvalidId)
    }

    /// Access a live slot by index
    pub fn by_index(&self, index: usize) -> Option<&T> {
        match self.slots.get(index) {
            Some(Slot::Occupied { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Access a live slot by index, mutably
    pub fn by_index_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.slots.get_mut(index) {
            Some(Slot::Occupied { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Id of the object in a live slot
    pub fn id_at(&self, index: usize) -> Option<I> {
        match self.slots.get(index) {
            Some(Slot::Occupied { generation, .. }) => Some(I::from_object_id(ObjectId::new(
                I::CLASS,
                index as u32,
                *generation,
            ))),
            _ => None,
        }
    }

    /// Free an object; its id becomes stale
    pub fn free(&mut self, id: I) -> Option<T> {
        if !self.slot_matches(id) {
            return None;
        }
        let index = id.index();
        let vacant = Slot::Vacant {
            generation: id.object_id().generation().wrapping_add(1).max(1),
        };
        match core::mem::replace(&mut self.slots[index], vacant) {
            Slot::Occupied { value, .. } => {
                self.free.push(index as u32);
                self.count -= 1;
                Some(value)
            }
            Slot::Vacant { .. } => None,
        }
    }

    /// Iterate live objects
    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    I::from_object_id(ObjectId::new(I::CLASS, index as u32, *generation)),
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    /// Indices of live objects
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Occupied { .. }))
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SemaphoreId, ThreadId};

    #[test]
    fn test_allocate_until_full() {
        let mut table: ObjectTable<SemaphoreId, u32> = ObjectTable::new(2);
        let a = table.allocate(10).unwrap();
        let b = table.allocate(20).unwrap();
        assert_eq!(table.allocate(30), Err(Status::TooMany));
        assert_eq!(table.get(a), Some(&10));
        assert_eq!(table.lookup(b), Ok(&20));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_stale_id_after_free() {
        let mut table: ObjectTable<SemaphoreId, u32> = ObjectTable::new(1);
        let old = table.allocate(1).unwrap();
        assert_eq!(table.free(old), Some(1));
        let new = table.allocate(2).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(table.get(old), None);
        assert_eq!(table.lookup_mut(old), Err(Status::InvalidId));
        assert_eq!(table.free(old), None);
        assert_eq!(table.get(new), Some(&2));
    }

    #[test]
    fn test_allocate_with_sees_own_id() {
        let mut table: ObjectTable<ThreadId, Option<ThreadId>> = ObjectTable::new(4);
        let id = table.allocate_with(Some).unwrap();
        assert_eq!(table.get(id), Some(&Some(id)));
        assert_eq!(table.id_at(id.index()), Some(id));
        assert_eq!(table.iter().count(), 1);
        assert_eq!(table.indices().collect::<alloc::vec::Vec<_>>(), [0]);
    }
}
