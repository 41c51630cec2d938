use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::timer::Timer;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Deadlines this close to now fire in the current sweep rather than forcing
/// an extra near-zero native arm.
const ACCURACY_MS: u64 = 5;

fn round_up(t: u64, resolution_ms: u64) -> u64 {
    t.div_ceil(resolution_ms) * resolution_ms
}

/// Coalesces many logical timers onto a single native [`Timer`].
///
/// Deadlines are rounded up to the configured resolution, so timers whose
/// deadlines land in the same bucket fire in one sweep. Ids are caller
/// chosen and must be unique among pending entries; every entry is one-shot.
/// Cancellation removes the id from the authoritative map and any queued
/// occurrence becomes stale.
pub struct CoarseTimer {
    inner: Rc<CoarseInner>,
}

struct CoarseInner {
    timer: Timer,
    resolution_ms: u64,
    origin: Instant,
    /// (deadline bucket in ms since origin, id), ordered by deadline.
    queue: RefCell<BTreeSet<(u64, u64)>>,
    /// Authoritative pending set: id to its scheduled bucket. A queue entry
    /// that disagrees with this map is stale and skipped.
    pending: RefCell<HashMap<u64, u64>>,
    /// Bucket the native timer is currently armed for, if any.
    armed_for: Cell<Option<u64>>,
    callback: RefCell<Box<dyn FnMut(u64)>>,
}

impl CoarseTimer {
    pub fn create(
        reactor: &Reactor,
        resolution: Duration,
        callback: impl FnMut(u64) + 'static,
    ) -> Result<CoarseTimer> {
        let inner = Rc::new(CoarseInner {
            timer: Timer::create(reactor)?,
            resolution_ms: (resolution.as_millis() as u64).max(1),
            origin: Instant::now(),
            queue: RefCell::new(BTreeSet::new()),
            pending: RefCell::new(HashMap::new()),
            armed_for: Cell::new(None),
            callback: RefCell::new(Box::new(callback)),
        });
        Ok(CoarseTimer { inner })
    }

    /// Schedule `id` to fire once after `interval`, rounded up to the
    /// resolution. Fails if `id` is already pending.
    pub fn set_timer(&self, interval: Duration, id: u64) -> Result<()> {
        let inner = &self.inner;
        if inner.pending.borrow().contains_key(&id) {
            return Err(Error::InvalidArgument("duplicate timer id"));
        }
        let now = inner.now_ms();
        let bucket = round_up(now + interval.as_millis() as u64, inner.resolution_ms);
        inner.queue.borrow_mut().insert((bucket, id));
        inner.pending.borrow_mut().insert(id, bucket);
        inner.rearm_if_earlier(bucket)
    }

    /// Remove a pending entry. Unknown ids are ignored, including ids that
    /// already fired.
    pub fn cancel(&self, id: u64) {
        self.inner.pending.borrow_mut().remove(&id);
    }

    pub fn cancel_all(&self) {
        self.inner.pending.borrow_mut().clear();
        self.inner.queue.borrow_mut().clear();
        self.inner.armed_for.set(None);
        self.inner.timer.cancel();
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.borrow().len()
    }
}

impl CoarseInner {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Arm the native timer for `bucket` unless it is already armed for an
    /// earlier one.
    fn rearm_if_earlier(self: &Rc<Self>, bucket: u64) -> Result<()> {
        match self.armed_for.get() {
            Some(armed) if armed <= bucket => return Ok(()),
            _ => {}
        }
        let delay = bucket.saturating_sub(self.now_ms());
        let weak = Rc::downgrade(self);
        self.timer.start(Duration::from_millis(delay), false, move || {
            if let Some(inner) = weak.upgrade() {
                inner.sweep();
            }
        })?;
        self.armed_for.set(Some(bucket));
        Ok(())
    }

    /// Fire every due entry, earliest bucket first, then rearm for the next
    /// pending deadline. Each entry is removed from both structures before
    /// its callback runs, so the callback may reschedule the same id.
    fn sweep(self: &Rc<Self>) {
        self.armed_for.set(None);
        let horizon = self.now_ms() + ACCURACY_MS;
        loop {
            let entry = {
                let mut queue = self.queue.borrow_mut();
                match queue.iter().next().copied() {
                    Some((bucket, id)) if bucket <= horizon => {
                        queue.remove(&(bucket, id));
                        Some((bucket, id))
                    }
                    _ => None,
                }
            };
            let Some((bucket, id)) = entry else { break };
            let live = {
                let mut pending = self.pending.borrow_mut();
                match pending.get(&id) {
                    Some(&scheduled) if scheduled == bucket => {
                        pending.remove(&id);
                        true
                    }
                    _ => false, // cancelled or rescheduled
                }
            };
            if live {
                (self.callback.borrow_mut())(id);
            }
        }
        let next = self.queue.borrow().iter().next().copied();
        if let Some((bucket, _)) = next {
            // a stale head only makes the wakeup early, never late
            let _ = self.rearm_if_earlier(bucket);
        }
    }
}

/// A [`CoarseTimer`] that dispatches each id to its own one-shot callback.
pub struct MultiplexedTimer {
    timer: CoarseTimer,
    callbacks: Rc<RefCell<HashMap<u64, Box<dyn FnMut(u64)>>>>,
}

impl MultiplexedTimer {
    pub fn create(reactor: &Reactor, resolution: Duration) -> Result<MultiplexedTimer> {
        let callbacks: Rc<RefCell<HashMap<u64, Box<dyn FnMut(u64)>>>> =
            Rc::new(RefCell::new(HashMap::new()));
        let weak: Weak<RefCell<HashMap<u64, Box<dyn FnMut(u64)>>>> = Rc::downgrade(&callbacks);
        let timer = CoarseTimer::create(reactor, resolution, move |id| {
            let Some(callbacks) = weak.upgrade() else { return };
            // remove before invoking so the callback may rearm the id
            let taken = callbacks.borrow_mut().remove(&id);
            if let Some(mut callback) = taken {
                callback(id);
            }
        })?;
        Ok(MultiplexedTimer { timer, callbacks })
    }

    pub fn set_timer(
        &self,
        interval: Duration,
        id: u64,
        callback: impl FnMut(u64) + 'static,
    ) -> Result<()> {
        self.timer.set_timer(interval, id)?;
        self.callbacks.borrow_mut().insert(id, Box::new(callback));
        Ok(())
    }

    pub fn cancel(&self, id: u64) {
        self.timer.cancel(id);
        self.callbacks.borrow_mut().remove(&id);
    }

    pub fn cancel_all(&self) {
        self.timer.cancel_all();
        self.callbacks.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_to_bucket() {
        assert_eq!(round_up(0, 100), 0);
        assert_eq!(round_up(1, 100), 100);
        assert_eq!(round_up(100, 100), 100);
        assert_eq!(round_up(101, 100), 200);
        assert_eq!(round_up(7, 1), 7);
    }
}
