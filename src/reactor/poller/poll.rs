//! Level-triggered poller backend, built on `poll(2)`.
//!
//! The kernel rescans a dense array of records on every call, so the
//! backend keeps exactly one record per registered channel and stores the
//! record's position in the channel's poller-private index. A channel whose
//! interest drops to empty keeps its record but has the fd negated to a
//! sentinel the kernel skips; physical removal swaps the doomed record with
//! the last one and fixes the swapped channel's index.

use crate::reactor::channel::Channel;
use crate::reactor::mask::EventMask;

use libc::{nfds_t, pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI, POLLRDHUP};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

pub(crate) struct PollPoller {
    /// One record per registered channel, ignored slots carrying a negated
    /// fd.
    fds: Vec<pollfd>,

    /// Registered channels, keyed by descriptor. Non-owning.
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl PollPoller {
    pub(crate) fn new() -> Self {
        Self {
            fds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    /// Blocks until readiness or timeout, then fills `active` with the
    /// ready channels and returns the post-wait timestamp.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Instant {
        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as nfds_t, timeout_ms) };
        let now = Instant::now();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                log::error!("poll failed: {err}");
            }
            return now;
        }

        if n == 0 {
            log::trace!("poll saw nothing happen");
            return now;
        }

        log::trace!("{n} event(s) ready");
        let mut remaining = n;
        for record in &self.fds {
            if remaining == 0 {
                break;
            }
            if record.revents == 0 {
                continue;
            }
            remaining -= 1;

            let channel = match self.channels.get(&record.fd).and_then(Weak::upgrade) {
                Some(channel) => channel,
                None => {
                    log::trace!("stale poll record for fd {}", record.fd);
                    continue;
                }
            };
            channel.set_received(ready_from_poll(record.revents));
            active.push(channel);
        }

        now
    }

    /// First-time add or interest change.
    pub(crate) fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        log::trace!(
            "update fd {fd} interest {:?} index {}",
            channel.interest(),
            channel.index()
        );

        if channel.index() < 0 {
            // First registration: append a record.
            assert!(
                !self.channels.contains_key(&fd),
                "fd {fd} is already registered"
            );
            self.fds.push(pollfd {
                fd,
                events: interest_to_poll(channel.interest()),
                revents: 0,
            });
            channel.set_index(self.fds.len() as i32 - 1);
            self.channels.insert(fd, channel.weak_self());
        } else {
            assert!(
                self.entry_matches(channel),
                "fd {fd} is registered to a different channel"
            );
            let index = channel.index() as usize;
            assert!(index < self.fds.len());

            let record = &mut self.fds[index];
            assert!(record.fd == fd || record.fd == sentinel(fd));
            record.fd = fd;
            record.events = interest_to_poll(channel.interest());
            record.revents = 0;
            if channel.is_none_event() {
                // Keep the slot, make the kernel skip it.
                record.fd = sentinel(fd);
            }
        }
    }

    /// Physical removal; the channel must have empty interest.
    pub(crate) fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        log::trace!("remove fd {fd}");
        assert!(self.entry_matches(channel), "fd {fd} is not registered");
        assert!(channel.is_none_event());

        let index = channel.index() as usize;
        assert!(index < self.fds.len());
        assert_eq!(self.fds[index].fd, sentinel(fd));

        self.channels.remove(&fd);
        if index == self.fds.len() - 1 {
            self.fds.pop();
        } else {
            // Swap the doomed record with the last one and repoint the
            // swapped channel's index.
            let moved_fd = self.fds[self.fds.len() - 1].fd;
            self.fds.swap_remove(index);
            let moved_fd = if moved_fd < 0 {
                restore(moved_fd)
            } else {
                moved_fd
            };
            if let Some(moved) = self.channels.get(&moved_fd).and_then(Weak::upgrade) {
                moved.set_index(index as i32);
            }
        }
        channel.set_index(-1);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.entry_matches(channel)
    }

    fn entry_matches(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|weak| Weak::ptr_eq(weak, &channel.weak_self()))
    }
}

/// Negates an fd into the range `poll(2)` ignores. Offset by one so fd 0
/// still maps to a negative value.
fn sentinel(fd: RawFd) -> RawFd {
    -fd - 1
}

/// Inverse of [`sentinel`].
fn restore(fd: RawFd) -> RawFd {
    -fd - 1
}

fn interest_to_poll(interest: EventMask) -> libc::c_short {
    let mut bits: libc::c_short = 0;
    if interest.contains(EventMask::READ) {
        bits |= POLLIN | POLLPRI;
    }
    if interest.contains(EventMask::WRITE) {
        bits |= POLLOUT;
    }
    bits
}

fn ready_from_poll(bits: libc::c_short) -> EventMask {
    let mut mask = EventMask::none();
    if bits & (POLLIN | POLLPRI) != 0 {
        mask |= EventMask::READ;
    }
    if bits & POLLOUT != 0 {
        mask |= EventMask::WRITE;
    }
    if bits & POLLERR != 0 {
        mask |= EventMask::ERROR;
    }
    if bits & POLLHUP != 0 {
        mask |= EventMask::HANGUP;
    }
    if bits & POLLNVAL != 0 {
        mask |= EventMask::INVALID;
    }
    if bits & POLLRDHUP != 0 {
        mask |= EventMask::READ_HANGUP;
    }
    mask
}
