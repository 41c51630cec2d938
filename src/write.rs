use crate::buffer::BufferChain;
use crate::error::Result;
use std::collections::{HashMap, VecDeque};

/// Completion callback for a buffered write. On success it receives the
/// total number of wire bytes the request covered.
pub(crate) type WriteCallback = Box<dyn FnOnce(Result<usize>)>;

pub(crate) struct WriteRequest {
    pub chain: BufferChain,
    /// Length of the chain when the request was submitted.
    pub total: usize,
    pub callback: WriteCallback,
}

/// Per-connection FIFO of buffered writes, keyed by pool slot.
///
/// The manager only does bookkeeping; draining to the socket lives in the
/// loop core where the handle is reachable. When a connection closes, its
/// queue is dropped wholesale: the pending callbacks are suppressed and the
/// fragment chains (and whatever keeps their payloads alive) are released.
pub(crate) struct WriteManager {
    queues: HashMap<usize, VecDeque<WriteRequest>>,
}

impl WriteManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: HashMap::with_capacity(capacity),
        }
    }

    pub fn submit(&mut self, slot: usize, chain: BufferChain, callback: WriteCallback) {
        let total = chain.len();
        self.queues.entry(slot).or_default().push_back(WriteRequest {
            chain,
            total,
            callback,
        });
    }

    pub fn front_mut(&mut self, slot: usize) -> Option<&mut WriteRequest> {
        self.queues.get_mut(&slot)?.front_mut()
    }

    pub fn pop_front(&mut self, slot: usize) -> Option<WriteRequest> {
        let queue = self.queues.get_mut(&slot)?;
        let request = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&slot);
        }
        request
    }

    /// No queued writes remain for the slot.
    pub fn is_idle(&self, slot: usize) -> bool {
        !self.queues.contains_key(&slot)
    }

    /// Drop every queued request for the slot without running callbacks.
    pub fn drop_connection(&mut self, slot: usize) {
        self.queues.remove(&slot);
    }

    /// Take every queued request for the slot, for error delivery.
    pub fn take_connection(&mut self, slot: usize) -> VecDeque<WriteRequest> {
        self.queues.remove(&slot).unwrap_or_default()
    }
}
