use crate::pool::HandleId;
use std::collections::HashMap;

/// Graceful shutdowns waiting for the connection's write queue to drain,
/// keyed by pool slot. Once the last buffered write completes, the loop core
/// shuts down the socket's write side and queues the handle for release.
pub(crate) struct ShutdownManager {
    pending: HashMap<usize, HandleId>,
}

impl ShutdownManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::with_capacity(capacity),
        }
    }

    /// Record a shutdown request. Duplicate requests for the same slot
    /// collapse into one.
    pub fn request(&mut self, id: HandleId) {
        self.pending.insert(id.slot, id);
    }

    /// Take the pending request for the slot, if any.
    pub fn take(&mut self, slot: usize) -> Option<HandleId> {
        self.pending.remove(&slot)
    }

    pub fn remove(&mut self, slot: usize) {
        self.pending.remove(&slot);
    }
}
