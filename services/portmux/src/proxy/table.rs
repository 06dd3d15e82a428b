//! Connection table.
//!
//! A generational arena: records live in slots, addressed by a [`ConnId`]
//! made of the slot index and the slot's generation at insert time. Releasing
//! a slot bumps its generation, so ids held by a former partner stop resolving
//! the moment the record is gone, even after the slot (or the OS handle
//! number) is reused. Free slots are reused lowest index first.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::os::fd::RawFd;

use super::connection::Connection;
use super::net::Source;
use crate::error::MuxError;

/// Opaque, generation-checked connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl ConnId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index; also the dispatcher's visit order.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

/// Fixed-capacity table of connection records.
#[derive(Debug)]
pub struct ConnectionTable<L, S> {
    slots: Vec<Slot<Connection<L, S>>>,
    free: BTreeSet<u32>,
    handles: HashMap<RawFd, ConnId>,
    capacity: usize,
    /// One past the highest occupied slot.
    bound: usize,
    len: usize,
}

impl<L: Source, S: Source> ConnectionTable<L, S> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        Self {
            slots: Vec::with_capacity(capacity.min(1024)),
            free: BTreeSet::new(),
            handles: HashMap::new(),
            capacity,
            bound: 0,
            len: 0,
        }
    }

    /// Store a record and return its id.
    ///
    /// Fails when every slot is taken, or when the record's handle number is
    /// still mapped to a live record. The rejected record is dropped, which
    /// closes its handle.
    pub fn insert(&mut self, conn: Connection<L, S>) -> Result<ConnId, MuxError> {
        let handle = conn.handle();
        if let Some(&owner) = self.handles.get(&handle) {
            return Err(MuxError::HandleAliased { handle, owner });
        }

        let index = match self.free.pop_first() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => {
                return Err(MuxError::TableFull {
                    capacity: self.capacity,
                })
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Some(conn);
        let id = ConnId::new(index, slot.generation);

        self.handles.insert(handle, id);
        self.len += 1;
        self.bound = self.bound.max(index as usize + 1);
        Ok(id)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection<L, S>> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<L, S>> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Mutable access to two distinct records at once.
    pub fn pair_mut(
        &mut self,
        a: ConnId,
        b: ConnId,
    ) -> Option<(&mut Connection<L, S>, &mut Connection<L, S>)> {
        if a.index == b.index || !self.contains(a) || !self.contains(b) {
            return None;
        }
        let (low, high) = (a.index().min(b.index()), a.index().max(b.index()));
        let (head, tail) = self.slots.split_at_mut(high);
        let low_entry = head[low].entry.as_mut()?;
        let high_entry = tail[0].entry.as_mut()?;
        if a.index() < b.index() {
            Some((low_entry, high_entry))
        } else {
            Some((high_entry, low_entry))
        }
    }

    /// Remove a record, invalidating its id and unmapping its handle.
    pub fn release(&mut self, id: ConnId) -> Option<Connection<L, S>> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)?;
        let conn = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        let handle = conn.handle();
        if self.handles.get(&handle) == Some(&id) {
            self.handles.remove(&handle);
        }
        self.free.insert(id.index);
        self.len -= 1;
        Some(conn)
    }

    /// Id of the record currently occupying a slot.
    pub fn id_at(&self, index: usize) -> Option<ConnId> {
        let slot = self.slots.get(index)?;
        slot.entry
            .as_ref()
            .map(|_| ConnId::new(index as u32, slot.generation))
    }

    /// Id of the live record owning an OS handle.
    pub fn lookup(&self, handle: RawFd) -> Option<ConnId> {
        self.handles.get(&handle).copied()
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Lower the bound past trailing empty slots.
    pub fn shrink_bound(&mut self) {
        while self.bound > 0 && self.slots[self.bound - 1].entry.is_none() {
            self.bound -= 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live records in ascending slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection<L, S>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|conn| (ConnId::new(index as u32, slot.generation), conn))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnId, &mut Connection<L, S>)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.entry
                .as_mut()
                .map(|conn| (ConnId::new(index as u32, generation), conn))
        })
    }
}
