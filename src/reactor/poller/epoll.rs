//! Default poller backend, built on `epoll`.
//!
//! Each registered descriptor carries its fd in the epoll data word; ready
//! events are resolved back to channels through the fd-keyed registry. The
//! event buffer starts small and doubles whenever the kernel fills it
//! completely, so a burst of ready descriptors is absorbed within two
//! polls.

use crate::reactor::channel::Channel;
use crate::reactor::mask::EventMask;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLLPRI, EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Instant;

/// Channel registry states, kept in the channel's poller-private index.
///
/// `NEW` channels have never been added to the epoll set; `ADDED` ones are
/// in it; `DELETED` ones are known to the registry but currently out of the
/// set because their interest dropped to empty.
const INDEX_NEW: i32 = -1;
const INDEX_ADDED: i32 = 1;
const INDEX_DELETED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct EpollPoller {
    epoll: OwnedFd,

    /// Reusable buffer handed to `epoll_wait`; always fully sized.
    events: Vec<epoll_event>,

    /// Registered channels, keyed by descriptor. Non-owning: a registered
    /// channel is kept alive by its user, and the removal assertions in
    /// `Channel` make a silent disappearance a bug worth tolerating, not
    /// ignoring.
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl EpollPoller {
    /// Creates the epoll set.
    ///
    /// # Panics
    ///
    /// Panics if the kernel refuses; a loop without a poller is
    /// unrecoverable.
    pub(crate) fn new() -> Self {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        assert!(
            fd >= 0,
            "epoll_create1 failed: {}",
            io::Error::last_os_error()
        );

        Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        }
    }

    /// Blocks until readiness or timeout, then fills `active` with the
    /// ready channels and returns the post-wait timestamp.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Instant {
        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        let now = Instant::now();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                log::error!("epoll_wait failed: {err}");
            }
            return now;
        }

        let n = n as usize;
        if n == 0 {
            log::trace!("epoll_wait saw nothing happen");
            return now;
        }

        log::trace!("{n} event(s) ready");
        for event in &self.events[..n] {
            let fd = event.u64 as RawFd;
            let channel = match self.channels.get(&fd).and_then(Weak::upgrade) {
                Some(channel) => channel,
                None => {
                    // The channel vanished between enumeration and lookup.
                    log::trace!("stale epoll event for fd {fd}");
                    continue;
                }
            };
            channel.set_received(ready_from_epoll(event.events));
            active.push(channel);
        }

        if n == self.events.len() {
            let doubled = self.events.len() * 2;
            self.events.resize(doubled, epoll_event { events: 0, u64: 0 });
        }

        now
    }

    /// First-time add or interest change.
    pub(crate) fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        let index = channel.index();
        log::trace!(
            "update fd {fd} interest {:?} index {index}",
            channel.interest()
        );

        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                assert!(
                    !self.channels.contains_key(&fd),
                    "fd {fd} is already registered"
                );
                self.channels.insert(fd, channel.weak_self());
            } else {
                assert!(
                    self.entry_matches(channel),
                    "fd {fd} is registered to a different channel"
                );
            }
            channel.set_index(INDEX_ADDED);
            self.control(EPOLL_CTL_ADD, channel);
        } else {
            assert!(
                self.entry_matches(channel),
                "fd {fd} is registered to a different channel"
            );
            assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.control(EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DELETED);
            } else {
                self.control(EPOLL_CTL_MOD, channel);
            }
        }
    }

    /// Physical removal; the channel must have empty interest.
    pub(crate) fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        log::trace!("remove fd {fd}");
        assert!(self.entry_matches(channel), "fd {fd} is not registered");
        assert!(channel.is_none_event());

        let index = channel.index();
        assert!(index == INDEX_ADDED || index == INDEX_DELETED);
        self.channels.remove(&fd);

        if index == INDEX_ADDED {
            self.control(EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.entry_matches(channel)
    }

    fn entry_matches(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|weak| Weak::ptr_eq(weak, &channel.weak_self()))
    }

    fn control(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = epoll_event {
            events: interest_to_epoll(channel.interest()),
            u64: fd as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if op == EPOLL_CTL_DEL {
                log::error!("epoll_ctl DEL failed for fd {fd}: {err}");
            } else {
                panic!("epoll_ctl op {op} failed for fd {fd}: {err}");
            }
        }
    }
}

fn interest_to_epoll(interest: EventMask) -> u32 {
    let mut bits = 0u32;
    if interest.contains(EventMask::READ) {
        bits |= (EPOLLIN | EPOLLPRI) as u32;
    }
    if interest.contains(EventMask::WRITE) {
        bits |= EPOLLOUT as u32;
    }
    bits
}

fn ready_from_epoll(bits: u32) -> EventMask {
    let mut mask = EventMask::none();
    if bits & (EPOLLIN | EPOLLPRI) as u32 != 0 {
        mask |= EventMask::READ;
    }
    if bits & EPOLLOUT as u32 != 0 {
        mask |= EventMask::WRITE;
    }
    if bits & EPOLLERR as u32 != 0 {
        mask |= EventMask::ERROR;
    }
    if bits & EPOLLHUP as u32 != 0 {
        mask |= EventMask::HANGUP;
    }
    if bits & EPOLLRDHUP as u32 != 0 {
        mask |= EventMask::READ_HANGUP;
    }
    mask
}
