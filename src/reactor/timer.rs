use crate::reactor::channel::Channel;
use crate::reactor::event_loop::EventLoop;
use crate::sys;
use crate::utils::Slab;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Opaque cancellation token for a scheduled timer.
///
/// Carries the per-loop sequence number assigned when the timer was
/// scheduled. Sequences are never reused, so a stale token can at worst hit
/// the no-op cancellation path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) sequence: u64,
}

/// A scheduled callback, one-shot or repeating.
pub(crate) struct Timer {
    callback: Box<dyn FnMut()>,
    expiration: Instant,
    /// `None` for one-shot timers.
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn run(&mut self) {
        (self.callback)();
    }

    /// Moves a repeating timer's expiration one interval past `now`.
    fn restart(&mut self, now: Instant) {
        // The interval is counted from the drain, not from the previous
        // deadline; a loop stalled past several periods fires once.
        if let Some(interval) = self.interval {
            self.expiration = now + interval;
        }
    }
}

/// Ordered set of pending timers, backed by a single timerfd registered as
/// an ordinary channel.
///
/// Every active timer lives in the slab arena and appears in both indices:
/// `by_expiry` orders (expiration, sequence) pairs for scheduling, and
/// `by_identity` maps sequence to arena slot for logarithmic cancellation.
/// The two always hold the same number of entries.
///
/// The timerfd is kept armed to the earliest expiration; its read callback
/// drains every timer that has come due.
pub(crate) struct TimerQueue {
    timerfd: OwnedFd,
    channel: Rc<Channel>,

    timers: Slab<Timer>,
    by_expiry: BTreeSet<(Instant, u64)>,
    by_identity: BTreeMap<u64, usize>,

    /// True while expired callbacks are running.
    calling_expired: bool,
    /// Sequences canceled from inside a callback during the current drain;
    /// they must not be re-armed even if repeating.
    canceling: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new(event_loop: Weak<EventLoop>) -> Self {
        let timerfd = sys::create_timerfd();
        let channel = Channel::with_weak(event_loop, timerfd.as_raw_fd());

        Self {
            timerfd,
            channel,
            timers: Slab::with_capacity(16),
            by_expiry: BTreeSet::new(),
            by_identity: BTreeMap::new(),
            calling_expired: false,
            canceling: HashSet::new(),
        }
    }

    /// The channel watching the timerfd. The loop wires its read callback
    /// and read interest once the loop itself is constructed.
    pub(crate) fn channel(&self) -> &Rc<Channel> {
        &self.channel
    }

    pub(crate) fn timerfd(&self) -> RawFd {
        self.timerfd.as_raw_fd()
    }

    /// Schedules a callback for `when`, repeating every `interval` if one
    /// is given. Runs on the loop thread.
    pub(crate) fn add(
        &mut self,
        callback: Box<dyn FnMut()>,
        when: Instant,
        interval: Option<Duration>,
        id: TimerId,
    ) {
        let timer = Timer {
            callback,
            expiration: when,
            interval,
            sequence: id.sequence,
        };
        if self.insert(timer) {
            sys::reset_timerfd(self.timerfd(), when);
        }
    }

    /// Cancels a scheduled timer. Runs on the loop thread.
    ///
    /// A timer already extracted for the current drain is recorded so the
    /// re-arm step drops it; an unknown or already-released id is a no-op.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        assert_eq!(self.by_expiry.len(), self.by_identity.len());

        if let Some(slot) = self.by_identity.remove(&id.sequence) {
            let timer = self.timers.remove(slot);
            let removed = self.by_expiry.remove(&(timer.expiration, timer.sequence));
            assert!(removed, "expiry index out of step with identity index");
        } else if self.calling_expired {
            self.canceling.insert(id.sequence);
        }

        assert_eq!(self.by_expiry.len(), self.by_identity.len());
    }

    /// Removes and returns every timer due at `now`, in expiration order,
    /// and marks the drain as running.
    ///
    /// The entries strictly below the (now, maximum-sequence) sentinel are
    /// exactly the expired ones.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        assert_eq!(self.by_expiry.len(), self.by_identity.len());

        let pending = self.by_expiry.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut self.by_expiry, pending);

        let mut expired = Vec::with_capacity(due.len());
        for (_, sequence) in due {
            let slot = self
                .by_identity
                .remove(&sequence)
                .expect("expiry index out of step with identity index");
            expired.push(self.timers.remove(slot));
        }

        self.calling_expired = true;
        self.canceling.clear();

        assert_eq!(self.by_expiry.len(), self.by_identity.len());
        expired
    }

    /// Ends a drain: re-arms repeating timers that were not canceled
    /// mid-drain, releases the rest, and re-arms the timerfd to the new
    /// earliest expiration.
    pub(crate) fn restart_or_release(&mut self, expired: Vec<Timer>, now: Instant) {
        self.calling_expired = false;

        for mut timer in expired {
            if timer.interval.is_some() && !self.canceling.contains(&timer.sequence) {
                timer.restart(now);
                self.insert(timer);
            }
        }

        if let Some(&(earliest, _)) = self.by_expiry.first() {
            sys::reset_timerfd(self.timerfd(), earliest);
        }
    }

    /// Inserts into the arena and both indices; true if the new timer is
    /// now the earliest.
    fn insert(&mut self, timer: Timer) -> bool {
        assert_eq!(self.by_expiry.len(), self.by_identity.len());

        let earliest_changed = match self.by_expiry.first() {
            None => true,
            Some(&(earliest, _)) => timer.expiration < earliest,
        };

        let key = (timer.expiration, timer.sequence);
        let sequence = timer.sequence;
        let slot = self.timers.insert(timer);
        let fresh = self.by_expiry.insert(key);
        debug_assert!(fresh, "duplicate timer sequence in expiry index");
        let previous = self.by_identity.insert(sequence, slot);
        debug_assert!(previous.is_none(), "duplicate timer sequence");

        assert_eq!(self.by_expiry.len(), self.by_identity.len());
        debug_assert_eq!(self.timers.len(), self.by_identity.len());
        earliest_changed
    }

    /// Index and arena sizes, for invariant checks.
    #[cfg(test)]
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        (
            self.by_expiry.len(),
            self.by_identity.len(),
            self.timers.len(),
        )
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

#[cfg(test)]
mod tests {
    use crate::reactor::event_loop::EventLoop;

    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    #[test]
    fn indices_stay_in_step_through_add_cancel_expire() {
        let event_loop = EventLoop::new();

        let id_a = event_loop.run_after(Duration::from_millis(5), || {});
        let _id_b = event_loop.run_after(Duration::from_millis(10), || {});
        let id_c = event_loop.run_every(Duration::from_millis(15), || {});

        let (expiry, identity, arena) = event_loop.timer_counts();
        assert_eq!(expiry, 3);
        assert_eq!(identity, 3);
        assert_eq!(arena, 3);

        event_loop.cancel(id_a);
        let (expiry, identity, arena) = event_loop.timer_counts();
        assert_eq!(expiry, 2);
        assert_eq!(identity, 2);
        assert_eq!(arena, 2);

        // Canceling a released id is a no-op.
        event_loop.cancel(id_a);
        let (expiry, identity, _) = event_loop.timer_counts();
        assert_eq!(expiry, 2);
        assert_eq!(identity, 2);

        event_loop.cancel(id_c);
        let (expiry, identity, arena) = event_loop.timer_counts();
        assert_eq!(expiry, 1);
        assert_eq!(identity, 1);
        assert_eq!(arena, 1);
    }

    #[test]
    fn repeating_timer_canceled_mid_drain_is_fully_released() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();

        let count = Rc::new(Cell::new(0u32));
        let id_cell: Rc<Cell<Option<super::TimerId>>> = Rc::new(Cell::new(None));

        let c = count.clone();
        let ids = id_cell.clone();
        let h = handle.clone();
        let id = event_loop.run_every(Duration::from_millis(10), move || {
            c.set(c.get() + 1);
            if c.get() == 3 {
                h.cancel(ids.get().expect("Timer id should be recorded"));
            }
        });
        id_cell.set(Some(id));

        let h = handle.clone();
        event_loop.run_after(Duration::from_millis(100), move || h.quit());
        event_loop.run();

        assert_eq!(count.get(), 3, "cancellation inside the third run sticks");
        let (expiry, identity, arena) = event_loop.timer_counts();
        assert_eq!(expiry, 0);
        assert_eq!(identity, 0);
        assert_eq!(arena, 0);
    }

    #[test]
    fn expired_one_shots_leave_the_queue_empty() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();

        let fired = Rc::new(Cell::new(0u32));
        for _ in 0..4 {
            let f = fired.clone();
            event_loop.run_after(Duration::from_millis(5), move || f.set(f.get() + 1));
        }

        let h = handle.clone();
        event_loop.run_after(Duration::from_millis(50), move || h.quit());
        event_loop.run();

        assert_eq!(fired.get(), 4);
        let (expiry, identity, arena) = event_loop.timer_counts();
        assert_eq!(expiry, 0);
        assert_eq!(identity, 0);
        assert_eq!(arena, 0);
    }

    #[test]
    fn simultaneous_expirations_run_before_later_ones() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();

        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let base = Instant::now();

        let o = order.clone();
        event_loop.run_at(base + Duration::from_millis(30), move || {
            o.borrow_mut().push("late")
        });
        let o = order.clone();
        event_loop.run_at(base + Duration::from_millis(10), move || {
            o.borrow_mut().push("early")
        });
        let o = order.clone();
        event_loop.run_at(base + Duration::from_millis(10), move || {
            o.borrow_mut().push("early-too")
        });

        // Let everything expire before the first poll so one drain sees all
        // three.
        std::thread::sleep(Duration::from_millis(60));

        let h = handle.clone();
        event_loop.run_after(Duration::from_millis(10), move || h.quit());
        event_loop.run();

        let order = order.borrow();
        assert_eq!(order.len(), 3);
        assert_eq!(order[2], "late", "later expiration must run last");
    }
}
