use crate::reactor::event_loop::EventLoop;
use crate::reactor::timer::TimerId;
use crate::sys;

use parking_lot::Mutex;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// A unit of work injected into a loop from any thread.
///
/// The pending list is shared across threads, so tasks must be `Send` even
/// when submitted from the loop thread itself.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// The cross-thread face of one event loop: the pending-task list, the quit
/// flag, the wakeup descriptor and the timer sequence allocator. Owned
/// jointly by the loop and every [`LoopHandle`] cloned from it.
pub(crate) struct Shared {
    /// The loop's owning thread, fixed at construction.
    thread: ThreadId,
    quit: AtomicBool,
    /// True while the loop is running the pending-task drain.
    calling_pending: AtomicBool,
    tasks: Mutex<Vec<Task>>,
    /// Written one 8-byte count by any thread, read by the loop thread.
    wakeup_fd: OwnedFd,
    next_sequence: AtomicU64,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            wakeup_fd: sys::create_eventfd(),
            next_sequence: AtomicU64::new(1),
        }
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.thread
    }

    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn wakeup_fd(&self) -> RawFd {
        self.wakeup_fd.as_raw_fd()
    }

    /// Unblocks the poller by bumping the wakeup counter.
    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        let n = sys::sys_write(self.wakeup_fd(), &one.to_ne_bytes());
        if n != 8 {
            log::error!("wakeup write returned {n} bytes instead of 8");
        }
    }

    pub(crate) fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        // The flag is only observed at the end of an iteration; an
        // off-thread quit must not wait out a full poll timeout.
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    pub(crate) fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Runs the task now when that is safe, otherwise defers it.
    ///
    /// "Now" requires being on the loop thread *and* outside the
    /// pending-task drain; a task submitted mid-drain always lands in the
    /// next iteration.
    pub(crate) fn run_or_queue(&self, task: Task) {
        if self.is_in_loop_thread() && !self.calling_pending.load(Ordering::Acquire) {
            task();
        } else {
            self.queue(task);
        }
    }

    /// Appends to the pending list, waking the loop when the caller cannot
    /// rely on the current iteration reaching the drain with this task in
    /// view.
    pub(crate) fn queue(&self, task: Task) {
        {
            self.tasks.lock().push(task);
        }
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wake();
        }
    }

    /// Swaps out the pending list for the drain.
    pub(crate) fn take_tasks(&self) -> Vec<Task> {
        std::mem::take(&mut *self.tasks.lock())
    }

    pub(crate) fn set_calling_pending(&self, on: bool) {
        self.calling_pending.store(on, Ordering::Release);
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// A cloneable, `Send + Sync` handle to one [`EventLoop`].
///
/// The loop object itself never leaves its thread; every other thread talks
/// to it through a handle. Tasks and timer callbacks submitted here are
/// shipped to the loop thread and run there, in submission order for tasks
/// and expiration order for timers.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<Shared>,
}

impl LoopHandle {
    /// Runs `task` on the loop thread: synchronously when called from that
    /// thread outside the pending-task drain, deferred otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.run_or_queue(Box::new(task));
    }

    /// Defers `task` to the loop's pending-task drain unconditionally.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.queue(Box::new(task));
    }

    /// Asks the loop to exit once the current iteration completes.
    pub fn quit(&self) {
        self.shared.quit();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Schedules `callback` at the instant `when`.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(when, None, callback)
    }

    /// Schedules `callback` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Instant::now() + delay, None, callback)
    }

    /// Schedules `callback` every `interval`, first firing one interval
    /// from now.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Instant::now() + interval, Some(interval), callback)
    }

    /// Cancels a timer scheduled on this loop. Honored at the next drain; a
    /// callback already running completes.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.cancel(id);
            }
        });
    }

    fn schedule(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let id = TimerId {
            sequence: self.shared.next_sequence(),
        };
        self.run_in_loop(move || match EventLoop::current() {
            Some(event_loop) => {
                event_loop.add_timer_with_id(Box::new(callback), when, interval, id)
            }
            None => log::warn!("timer scheduled on a thread whose loop is gone"),
        });
        id
    }
}
