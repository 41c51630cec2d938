use crate::error::{Error, Result};
use crate::pool::{HandleId, HandleKind, Owner};
use crate::reactor::{Reactor, ReactorInner};
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// A one-shot or periodic timer bound to a reactor.
///
/// The timer occupies a handle-pool slot but carries no OS handle; it is
/// driven by the loop's poll timeout. Dropping the timer cancels it and
/// releases its slot.
pub struct Timer {
    core: Rc<TimerCore>,
}

pub(crate) struct TimerCore {
    reactor: Weak<ReactorInner>,
    handle: Cell<Option<HandleId>>,
    callback: RefCell<Option<Box<dyn FnMut()>>>,
}

impl Timer {
    pub fn create(reactor: &Reactor) -> Result<Timer> {
        let core = Rc::new(TimerCore {
            reactor: Rc::downgrade(reactor.inner()),
            handle: Cell::new(None),
            callback: RefCell::new(None),
        });
        let weak = Rc::downgrade(&core);
        let id = reactor
            .inner()
            .with_core(|c| c.pool.alloc(HandleKind::Timer, Owner::Timer(weak)));
        core.handle.set(Some(id));
        Ok(Timer { core })
    }

    /// Arm the timer. A second `start` replaces both the interval and the
    /// callback of the first.
    pub fn start(
        &self,
        interval: Duration,
        periodic: bool,
        callback: impl FnMut() + 'static,
    ) -> Result<()> {
        let inner = self.core.reactor.upgrade().ok_or(Error::NotConnected)?;
        let id = self.core.handle.get().ok_or(Error::NotConnected)?;
        *self.core.callback.borrow_mut() = Some(Box::new(callback));
        inner.with_core(|c| c.timers.arm(id, interval, periodic));
        Ok(())
    }

    /// Disarm without releasing the slot; the timer can be started again.
    pub fn cancel(&self) {
        if let (Some(inner), Some(id)) = (self.core.reactor.upgrade(), self.core.handle.get()) {
            inner.with_core(|c| c.timers.disarm(id));
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let (Some(inner), Some(id)) = (self.core.reactor.upgrade(), self.core.handle.take()) {
            inner.with_core(|c| {
                c.timers.disarm(id);
                c.close_handle(id);
            });
        }
    }
}

impl TimerCore {
    /// Run the user callback. The callback slot is emptied for the duration
    /// of the call so the callback may freely restart or cancel this timer.
    pub(crate) fn invoke(&self) {
        let taken = self.callback.borrow_mut().take();
        if let Some(mut callback) = taken {
            callback();
            let mut slot = self.callback.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

struct TimerState {
    deadline: Instant,
    period: Option<Duration>,
    epoch: u64,
}

/// Deadline tracking for every armed timer, keyed by pool slot.
///
/// The heap holds (deadline, epoch, slot) triples and is never purged on
/// disarm; entries whose epoch or deadline no longer match the authoritative
/// map are skipped when they surface. Rearming bumps the epoch so an old
/// heap entry for the same slot cannot fire.
pub(crate) struct NativeTimers {
    armed: HashMap<usize, TimerState>,
    heap: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    next_epoch: u64,
}

impl NativeTimers {
    pub fn new() -> Self {
        Self {
            armed: HashMap::new(),
            heap: BinaryHeap::new(),
            next_epoch: 0,
        }
    }

    pub fn arm(&mut self, id: HandleId, interval: Duration, periodic: bool) {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let deadline = Instant::now() + interval;
        self.armed.insert(
            id.slot,
            TimerState {
                deadline,
                period: periodic.then_some(interval),
                epoch,
            },
        );
        self.heap.push(Reverse((deadline, epoch, id.slot)));
    }

    pub fn disarm(&mut self, id: HandleId) {
        self.armed.remove(&id.slot);
    }

    /// Earliest pending deadline, for computing the poll timeout. May be
    /// stale (already disarmed); an early wakeup is harmless.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.armed.is_empty() {
            return None;
        }
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop every due timer, rearming periodic ones. Returns the slots whose
    /// timers fired, in deadline order.
    pub fn collect_due(&mut self, now: Instant) -> Vec<usize> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, epoch, slot))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            let state = match self.armed.get_mut(&slot) {
                Some(state) if state.epoch == epoch && state.deadline == deadline => state,
                _ => continue, // stale entry
            };
            match state.period {
                Some(period) => {
                    state.deadline = now + period;
                    self.heap.push(Reverse((state.deadline, epoch, slot)));
                }
                None => {
                    self.armed.remove(&slot);
                }
            }
            due.push(slot);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(slot: usize) -> HandleId {
        HandleId {
            slot,
            generation: 0,
        }
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut timers = NativeTimers::new();
        timers.arm(id(3), Duration::from_millis(0), false);
        let now = Instant::now() + Duration::from_millis(1);
        assert_eq!(timers.collect_due(now), vec![3]);
        assert!(timers.collect_due(now + Duration::from_secs(1)).is_empty());
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_periodic_rearms() {
        let mut timers = NativeTimers::new();
        timers.arm(id(1), Duration::from_millis(10), true);
        let t1 = Instant::now() + Duration::from_millis(11);
        assert_eq!(timers.collect_due(t1), vec![1]);
        let t2 = t1 + Duration::from_millis(11);
        assert_eq!(timers.collect_due(t2), vec![1]);
    }

    #[test]
    fn test_disarm_suppresses_stale_heap_entry() {
        let mut timers = NativeTimers::new();
        timers.arm(id(1), Duration::from_millis(0), false);
        timers.disarm(id(1));
        let now = Instant::now() + Duration::from_millis(1);
        assert!(timers.collect_due(now).is_empty());
    }

    #[test]
    fn test_rearm_replaces_previous_deadline() {
        let mut timers = NativeTimers::new();
        timers.arm(id(1), Duration::from_millis(0), false);
        timers.arm(id(1), Duration::from_secs(60), false);
        let now = Instant::now() + Duration::from_millis(1);
        // the first arming is stale; only the far deadline remains
        assert!(timers.collect_due(now).is_empty());
        assert!(timers.next_deadline().is_some());
    }

    #[test]
    fn test_due_in_deadline_order() {
        let mut timers = NativeTimers::new();
        timers.arm(id(1), Duration::from_millis(5), false);
        timers.arm(id(2), Duration::from_millis(1), false);
        timers.arm(id(3), Duration::from_millis(3), false);
        let now = Instant::now() + Duration::from_millis(10);
        assert_eq!(timers.collect_due(now), vec![2, 3, 1]);
    }
}
