use crate::server::ServerCore;
use crate::stream::StreamCore;
use crate::timer::TimerCore;
use slab::Slab;
use std::rc::Weak;

/// Identifies a pool slot. The generation counter distinguishes a live
/// occupant from a stale id whose slot has since been recycled.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct HandleId {
    pub slot: usize,
    pub generation: u32,
}

impl HandleId {
    pub fn token(&self) -> mio::Token {
        mio::Token(self.slot)
    }
}

/// The native object occupying a slot.
pub(crate) enum HandleKind {
    Tcp(mio::net::TcpStream),
    Listener(mio::net::TcpListener),
    /// Timers have no OS handle; they occupy a slot so their lifecycle is
    /// managed like every other handle.
    Timer,
}

/// Back-reference from a slot to whichever object owns it. Weak so that a
/// dropped owner never keeps its slot alive, and so a recycled slot can be
/// detected by a failed upgrade.
#[derive(Clone)]
pub(crate) enum Owner {
    /// No owner; events on this slot are stale and ignored.
    None,
    Stream(Weak<StreamCore>),
    /// An in-flight connect, identified by its request tag.
    Connect(u64),
    Timer(Weak<TimerCore>),
    Listener(Weak<ServerCore>),
}

pub(crate) struct HandleSlot {
    pub kind: HandleKind,
    pub owner: Owner,
    pub generation: u32,
    /// Readable interest currently registered with the poller.
    pub read_interest: bool,
    /// Queued for release at the end of the current loop turn.
    pub closing: bool,
}

/// Fixed-capacity-biased slot allocator for native handles. Slots are
/// recycled with a fresh generation; storage beyond the configured capacity
/// is returned to the allocator once the excess drains.
pub(crate) struct HandlePool {
    slots: Slab<HandleSlot>,
    capacity: usize,
    next_generation: u32,
}

impl HandlePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            capacity,
            next_generation: 0,
        }
    }

    pub fn alloc(&mut self, kind: HandleKind, owner: Owner) -> HandleId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let slot = self.slots.insert(HandleSlot {
            kind,
            owner,
            generation,
            read_interest: false,
            closing: false,
        });
        HandleId { slot, generation }
    }

    pub fn get(&self, id: HandleId) -> Option<&HandleSlot> {
        self.slots
            .get(id.slot)
            .filter(|s| s.generation == id.generation)
    }

    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut HandleSlot> {
        self.slots
            .get_mut(id.slot)
            .filter(|s| s.generation == id.generation)
    }

    /// Lookup by raw slot index, for poll-token dispatch where no
    /// generation is known.
    pub fn get_slot_mut(&mut self, slot: usize) -> Option<&mut HandleSlot> {
        self.slots.get_mut(slot)
    }

    /// The owner recorded for a raw slot index, if the slot is occupied.
    pub fn slot_owner(&self, slot: usize) -> Option<Owner> {
        self.slots.get(slot).map(|s| s.owner.clone())
    }

    /// Remove the slot, returning its contents so the caller can deregister
    /// and drop the native object. Stale ids return `None`.
    pub fn release(&mut self, id: HandleId) -> Option<HandleSlot> {
        if self.get(id).is_none() {
            return None;
        }
        let slot = self.slots.remove(id.slot);
        if self.slots.capacity() > self.capacity && self.slots.len() <= self.capacity {
            self.slots.shrink_to_fit();
        }
        Some(slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_release_recycles_with_new_generation() {
        let mut pool = HandlePool::new(4);
        let a = pool.alloc(HandleKind::Timer, Owner::None);
        assert!(pool.get(a).is_some());
        assert!(pool.release(a).is_some());
        assert!(pool.get(a).is_none());

        let b = pool.alloc(HandleKind::Timer, Owner::None);
        assert_eq!(a.slot, b.slot);
        assert_ne!(a.generation, b.generation);
        // the stale id no longer resolves
        assert!(pool.get(a).is_none());
        assert!(pool.get(b).is_some());
    }

    #[test]
    fn test_release_stale_id_is_noop() {
        let mut pool = HandlePool::new(4);
        let a = pool.alloc(HandleKind::Timer, Owner::None);
        assert!(pool.release(a).is_some());
        assert!(pool.release(a).is_none());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_grows_past_capacity() {
        let mut pool = HandlePool::new(2);
        let ids: Vec<_> = (0..8)
            .map(|_| pool.alloc(HandleKind::Timer, Owner::None))
            .collect();
        assert_eq!(pool.len(), 8);
        for id in ids {
            assert!(pool.release(id).is_some());
        }
        assert_eq!(pool.len(), 0);
    }
}
