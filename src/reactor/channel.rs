use crate::reactor::event_loop::EventLoop;
use crate::reactor::mask::EventMask;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Weak as ArcWeak};
use std::time::Instant;

/// Callback invoked when the descriptor is readable, with the timestamp
/// taken right after the poller returned.
type ReadCallback = Box<dyn FnMut(Instant)>;
/// Callback for the writable, peer-closed and error events.
type EventCallback = Box<dyn FnMut()>;

/// A `Channel` couples one file descriptor to an interest mask and a set of
/// event callbacks. It is the only object the event loop dispatches to: the
/// wakeup descriptor, the timer descriptor and every user socket reach the
/// loop through one of these.
///
/// A channel belongs to exactly one [`EventLoop`] for its whole life and is
/// only ever touched from that loop's thread. It never owns the descriptor
/// it watches; the descriptor must stay open for as long as the channel is
/// registered.
///
/// Registration is lazy: the channel is handed to the poller the first time
/// its interest becomes non-empty (via the `enable_*` methods). To retire a
/// channel, call [`disable_all`](Self::disable_all) followed by
/// [`remove`](Self::remove); only then may the last `Rc` be dropped.
pub struct Channel {
    /// Back-reference to the owning loop. Never owning: the loop owns its
    /// pollers and internal channels, and user channels must not keep a
    /// dead loop alive.
    event_loop: Weak<EventLoop>,
    /// Self-reference handed to the poller registry.
    weak_self: Weak<Channel>,

    fd: RawFd,
    /// Events the user wants delivered.
    interest: Cell<EventMask>,
    /// Events produced by the most recent poll; only meaningful during the
    /// dispatch that follows that poll.
    received: Cell<EventMask>,
    /// Poller-private slot; the meaning of the value belongs to the poller
    /// implementation.
    index: Cell<i32>,

    /// Whether a HANGUP without READ is worth a warning line.
    log_hup: Cell<bool>,
    /// Optional shared-ownership guard; see [`tie`](Self::tie).
    tie: RefCell<Option<ArcWeak<dyn Any>>>,

    event_handling: Cell<bool>,
    added_to_loop: Cell<bool>,

    read_callback: RefCell<Option<ReadCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
}

impl Channel {
    /// Creates a channel watching `fd` on `event_loop`.
    ///
    /// The channel starts with empty interest and is not yet known to the
    /// poller.
    pub fn new(event_loop: &Rc<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Channel::with_weak(Rc::downgrade(event_loop), fd)
    }

    /// Internal constructor for channels created while the loop itself is
    /// still being assembled (wakeup and timer descriptors).
    pub(crate) fn with_weak(event_loop: Weak<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|weak_self| Channel {
            event_loop,
            weak_self: weak_self.clone(),
            fd,
            interest: Cell::new(EventMask::none()),
            received: Cell::new(EventMask::none()),
            index: Cell::new(-1),
            log_hup: Cell::new(true),
            tie: RefCell::new(None),
            event_handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> EventMask {
        self.interest.get()
    }

    pub fn is_none_event(&self) -> bool {
        self.interest.get().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.get().contains(EventMask::READ)
    }

    pub fn is_writing(&self) -> bool {
        self.interest.get().contains(EventMask::WRITE)
    }

    /// Stores the readable callback. Only the loop invokes it, with the
    /// poll-return timestamp.
    pub fn set_read_callback(&self, callback: impl FnMut(Instant) + 'static) {
        *self.read_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl FnMut() + 'static) {
        *self.write_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_close_callback(&self, callback: impl FnMut() + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl FnMut() + 'static) {
        *self.error_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Ties the channel to the object whose lifetime dominates it.
    ///
    /// While a tie is set, each dispatch first upgrades the weak reference
    /// and holds the resulting strong reference for the duration of the
    /// callbacks, so the owner cannot be destroyed mid-callback. If the
    /// upgrade fails because the owner is already gone, the dispatch is
    /// silently suppressed.
    ///
    /// The owner lives in an `Arc` so other threads may hold the same
    /// object; the channel itself still only touches it from the loop
    /// thread.
    pub fn tie<T: 'static>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any> = owner.clone();
        let weak: ArcWeak<dyn Any> = Arc::downgrade(&owner);
        *self.tie.borrow_mut() = Some(weak);
    }

    /// Silences the warning otherwise logged when the peer hangs up.
    pub fn set_log_hup(&self, on: bool) {
        self.log_hup.set(on);
    }

    pub fn enable_reading(&self) {
        self.interest.set(self.interest.get() | EventMask::READ);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.interest.set(self.interest.get() - EventMask::READ);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.interest.set(self.interest.get() | EventMask::WRITE);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.interest.set(self.interest.get() - EventMask::WRITE);
        self.update();
    }

    pub fn disable_all(&self) {
        self.interest.set(EventMask::none());
        self.update();
    }

    /// Deregisters the channel from its loop.
    ///
    /// Valid only once the interest mask is empty. After this returns the
    /// poller no longer knows the descriptor and the channel may be
    /// dropped (outside of dispatch).
    pub fn remove(&self) {
        assert!(
            self.is_none_event(),
            "channel for fd {} removed with non-empty interest",
            self.fd
        );
        self.added_to_loop.set(false);
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    /// Re-registers the current interest mask with the loop's poller.
    fn update(&self) {
        self.added_to_loop.set(true);
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(self);
        }
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.get()
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.set(index);
    }

    pub(crate) fn set_received(&self, received: EventMask) {
        self.received.set(received);
    }

    pub(crate) fn weak_self(&self) -> Weak<Channel> {
        self.weak_self.clone()
    }

    pub(crate) fn owner_matches(&self, event_loop: &Weak<EventLoop>) -> bool {
        Weak::ptr_eq(&self.event_loop, event_loop)
    }

    /// Dispatches the events from the most recent poll to the installed
    /// callbacks, honoring the tie guard.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        let tie = self.tie.borrow().clone();
        match tie {
            Some(weak) => {
                // Hold the owner alive across the callbacks. If it is
                // already gone there is nobody left to deliver to.
                if let Some(_guard) = weak.upgrade() {
                    self.handle_event_with_guard(receive_time);
                }
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    /// The canonical dispatch order: close, then error, then read, then
    /// write. Close runs first so a peer shutdown is observed before any
    /// data; errors run before data so the read and write callbacks see the
    /// failure; write runs last so a write that provokes a close observes
    /// the close.
    fn handle_event_with_guard(&self, receive_time: Instant) {
        self.event_handling.set(true);
        let received = self.received.get();
        log::trace!("channel fd {} dispatching {:?}", self.fd, received);

        if received.contains(EventMask::HANGUP) && !received.contains(EventMask::READ) {
            if self.log_hup.get() {
                log::warn!("channel fd {} received HANGUP", self.fd);
            }
            if let Some(callback) = self.close_callback.borrow_mut().as_mut() {
                callback();
            }
        }

        if received.contains(EventMask::INVALID) {
            log::warn!("channel fd {} received INVALID", self.fd);
        }

        if received.intersects(EventMask::ERROR | EventMask::INVALID) {
            if let Some(callback) = self.error_callback.borrow_mut().as_mut() {
                callback();
            }
        }

        if received.intersects(EventMask::READ | EventMask::READ_HANGUP) {
            if let Some(callback) = self.read_callback.borrow_mut().as_mut() {
                callback(receive_time);
            }
        }

        if received.contains(EventMask::WRITE) {
            if let Some(callback) = self.write_callback.borrow_mut().as_mut() {
                callback();
            }
        }

        self.event_handling.set(false);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        assert!(
            !self.event_handling.get(),
            "channel for fd {} destroyed during dispatch",
            self.fd
        );
        assert!(
            !self.added_to_loop.get(),
            "channel for fd {} destroyed while still registered",
            self.fd
        );
    }
}
