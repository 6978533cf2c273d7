use crate::reactor::channel::Channel;
use crate::reactor::handle::{LoopHandle, Shared};
use crate::reactor::poller::Poller;
use crate::reactor::timer::{TimerId, TimerQueue};
use crate::sys;

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on one poller wait. The exact value is not critical: timers
/// re-arm the timerfd and cross-thread submissions write the wakeup
/// descriptor, so the loop never sleeps through work.
const POLL_TIMEOUT_MS: i32 = 10_000;

thread_local! {
    /// The loop owning the current thread, if any. Enforces the
    /// one-loop-per-thread rule and lets deferred tasks find their loop
    /// without threading a reference through every closure.
    static CURRENT_LOOP: RefCell<Option<Weak<EventLoop>>> = const { RefCell::new(None) };
}

/// A per-thread reactor.
///
/// One `EventLoop` owns one poller, the registry of channels watching file
/// descriptors, a timerfd-backed timer queue and an eventfd-backed
/// cross-thread task queue. Once [`run`](Self::run) is entered the loop
/// repeats: wait for readiness, dispatch ready channels in the order the
/// poller reported them, then drain the pending tasks, until
/// [`quit`](Self::quit) is observed.
///
/// The loop is bound to the thread that constructed it and never migrates;
/// constructing a second loop on a thread whose loop is still alive
/// panics. The object is deliberately `!Send`: other threads interact with
/// the loop only through the [`LoopHandle`] returned by
/// [`handle`](Self::handle).
///
/// Callbacks are cooperative. They run to completion on the loop thread and
/// must not block; blocking work belongs on another thread that posts its
/// results back via `run_in_loop`. This is a contract, not an enforcement.
/// A panic in a callback propagates out of `run` and poisons nothing but
/// the current thread.
pub struct EventLoop {
    shared: Arc<Shared>,
    self_weak: Weak<EventLoop>,

    poller: RefCell<Poller>,
    timers: RefCell<TimerQueue>,
    /// Channel watching the wakeup eventfd; its read callback just drains
    /// the counter.
    wakeup: Rc<Channel>,

    /// Channels reported ready by the most recent poll.
    active: RefCell<Vec<Rc<Channel>>>,
    /// Descriptor of the channel currently in dispatch, or -1.
    current_active_fd: Cell<i32>,

    looping: Cell<bool>,
    event_handling: Cell<bool>,
    iteration: Cell<u64>,
    poll_return: Cell<Instant>,
}

impl EventLoop {
    /// Creates the loop owning the current thread.
    ///
    /// Acquires the wakeup and timer descriptors and registers their
    /// channels; they are the first two channels the poller learns about.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a live `EventLoop`, or if the
    /// kernel refuses one of the loop's descriptors.
    pub fn new() -> Rc<EventLoop> {
        CURRENT_LOOP.with(|current| {
            if let Some(existing) = current.borrow().as_ref() {
                if existing.upgrade().is_some() {
                    panic!(
                        "another EventLoop already exists on thread {:?}",
                        thread::current().id()
                    );
                }
            }
        });

        let shared = Arc::new(Shared::new());
        let event_loop = Rc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            wakeup: Channel::with_weak(weak.clone(), shared.wakeup_fd()),
            timers: RefCell::new(TimerQueue::new(weak.clone())),
            poller: RefCell::new(Poller::new()),
            self_weak: weak.clone(),
            shared,
            active: RefCell::new(Vec::new()),
            current_active_fd: Cell::new(-1),
            looping: Cell::new(false),
            event_handling: Cell::new(false),
            iteration: Cell::new(0),
            poll_return: Cell::new(Instant::now()),
        });

        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = Some(Rc::downgrade(&event_loop));
        });

        let weak = Rc::downgrade(&event_loop);
        event_loop.wakeup.set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.handle_wakeup();
            }
        });
        event_loop.wakeup.enable_reading();

        let weak = Rc::downgrade(&event_loop);
        {
            let timers = event_loop.timers.borrow();
            timers.channel().set_read_callback(move |_| {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.drain_expired_timers();
                }
            });
            timers.channel().enable_reading();
        }

        log::trace!(
            "EventLoop created on thread {:?}",
            event_loop.shared.thread()
        );
        event_loop
    }

    /// The loop owning the calling thread, if one is alive.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// A cloneable cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs the loop until [`quit`](Self::quit) is observed.
    ///
    /// Must be called on the owning thread and is not reentrant.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get(), "run is not reentrant");
        self.looping.set(true);
        log::trace!("EventLoop starts looping");

        loop {
            let receive_time = {
                let mut active = self.active.borrow_mut();
                active.clear();
                self.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active)
            };
            self.poll_return.set(receive_time);
            self.iteration.set(self.iteration.get() + 1);

            self.event_handling.set(true);
            let ready = self.active.borrow().len();
            for i in 0..ready {
                let channel = self.active.borrow()[i].clone();
                self.current_active_fd.set(channel.fd());
                channel.handle_event(receive_time);
            }
            self.current_active_fd.set(-1);
            self.event_handling.set(false);

            self.drain_pending_tasks();

            if self.shared.quit_requested() {
                break;
            }
        }

        log::trace!("EventLoop stops looping");
        self.looping.set(false);
    }

    /// Asks the loop to exit once the current iteration completes its
    /// dispatch and drain. Thread-safe; cancellation is at iteration
    /// granularity, never preemptive.
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Runs `task` on the loop thread: synchronously when called from that
    /// thread outside the pending-task drain, deferred otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.run_or_queue(Box::new(task));
    }

    /// Defers `task` to the pending-task drain unconditionally.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.queue(Box::new(task));
    }

    /// Schedules `callback` at the instant `when`.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        let id = TimerId {
            sequence: self.shared.next_sequence(),
        };
        self.timers
            .borrow_mut()
            .add(Box::new(callback), when, None, id);
        id
    }

    /// Schedules `callback` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Schedules `callback` every `interval`, first firing one interval
    /// from now.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        let id = TimerId {
            sequence: self.shared.next_sequence(),
        };
        self.timers.borrow_mut().add(
            Box::new(callback),
            Instant::now() + interval,
            Some(interval),
            id,
        );
        id
    }

    /// Cancels a timer. Honored at the next drain; a callback already
    /// running completes.
    pub fn cancel(&self, id: TimerId) {
        self.assert_in_loop_thread();
        self.timers.borrow_mut().cancel(id);
    }

    /// Registers or re-registers a channel with the poller.
    pub fn update_channel(&self, channel: &Channel) {
        assert!(
            channel.owner_matches(&self.self_weak),
            "channel belongs to a different loop"
        );
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    /// Removes a channel from the poller.
    ///
    /// During dispatch, removing a channel other than the one currently
    /// being dispatched is allowed only if that channel is not in the
    /// remainder of the active list.
    pub fn remove_channel(&self, channel: &Channel) {
        assert!(
            channel.owner_matches(&self.self_weak),
            "channel belongs to a different loop"
        );
        self.assert_in_loop_thread();

        if self.event_handling.get() {
            let in_active = self
                .active
                .borrow()
                .iter()
                .any(|active| active.fd() == channel.fd());
            assert!(
                self.current_active_fd.get() == channel.fd() || !in_active,
                "removing fd {} while it is pending dispatch",
                channel.fd()
            );
        }

        self.poller.borrow_mut().remove_channel(channel);
    }

    /// Whether the poller currently knows this channel.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        assert!(
            channel.owner_matches(&self.self_weak),
            "channel belongs to a different loop"
        );
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// # Panics
    ///
    /// Panics when called off the owning thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by thread {:?} was accessed from thread {:?}",
                self.shared.thread(),
                thread::current().id()
            );
        }
    }

    /// Number of completed poll cycles.
    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }

    /// Timestamp taken right after the most recent poll returned.
    pub fn poll_return_time(&self) -> Instant {
        self.poll_return.get()
    }

    pub(crate) fn add_timer_with_id(
        &self,
        callback: Box<dyn FnMut()>,
        when: Instant,
        interval: Option<Duration>,
        id: TimerId,
    ) {
        self.assert_in_loop_thread();
        self.timers.borrow_mut().add(callback, when, interval, id);
    }

    /// Runs every timer that has come due.
    ///
    /// The expired timers are moved out of the queue before any callback
    /// runs, so callbacks are free to add and cancel timers; the re-arm
    /// step afterwards re-inserts surviving repeating timers and arms the
    /// timerfd to the new earliest expiration.
    fn drain_expired_timers(&self) {
        let now = Instant::now();
        sys::read_timerfd(self.timers.borrow().timerfd());

        let mut expired = self.timers.borrow_mut().take_expired(now);
        for timer in &mut expired {
            timer.run();
        }
        self.timers.borrow_mut().restart_or_release(expired, now);
    }

    /// Empties the wakeup counter; the point was only to return from poll.
    fn handle_wakeup(&self) {
        let mut buf = [0u8; 8];
        let n = sys::sys_read(self.shared.wakeup_fd(), &mut buf);
        if n != 8 {
            log::error!("wakeup read returned {n} bytes instead of 8");
        }
    }

    /// Runs the pending cross-thread tasks in submission order.
    ///
    /// The list is swapped out under the lock and run unlocked, so tasks
    /// submitted by a running task land on the fresh list and run next
    /// iteration instead of extending this drain forever.
    fn drain_pending_tasks(&self) {
        self.shared.set_calling_pending(true);
        let tasks = self.shared.take_tasks();
        for task in tasks {
            task();
        }
        self.shared.set_calling_pending(false);
    }

    /// Timer index and arena sizes, for invariant checks.
    #[cfg(test)]
    pub(crate) fn timer_counts(&self) -> (usize, usize, usize) {
        self.timers.borrow().counts()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        log::trace!(
            "EventLoop on thread {:?} destructs",
            self.shared.thread()
        );
        // The internal channels cannot reach the loop any more (the weak
        // back-references are already dead), so clearing their flags here
        // is what lets their destructors pass; the descriptors themselves
        // close with their OwnedFd owners.
        self.wakeup.disable_all();
        self.wakeup.remove();

        CURRENT_LOOP.with(|current| {
            let stale = current
                .borrow()
                .as_ref()
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self as *const _));
            if stale {
                *current.borrow_mut() = None;
            }
        });
    }
}
