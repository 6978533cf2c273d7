//! Readiness-multiplexing backends.
//!
//! A poller blocks on the set of registered descriptors until one becomes
//! ready or a timeout elapses, and hands the loop the channels to dispatch.
//! Both backends expose the same surface:
//!
//! - `poll(timeout_ms, active)` — block up to `timeout_ms` milliseconds
//!   (negative: indefinitely, zero: not at all), push the ready channels
//!   onto `active` with their `received` masks set, and return the
//!   timestamp taken right after the kernel call returned.
//! - `update_channel(channel)` — first-time add or interest change.
//! - `remove_channel(channel)` — physical removal; the channel's interest
//!   must already be empty.
//! - `has_channel(channel)` — registry membership.
//!
//! The backend is fixed at build time; the event loop never observes which
//! one is in use. The default is the epoll demultiplexer; the `poll`
//! cargo feature selects the level-triggered poll(2) scan instead.

#[cfg(not(feature = "poll"))]
mod epoll;

#[cfg(feature = "poll")]
mod poll;

#[cfg(not(feature = "poll"))]
pub(crate) use epoll::EpollPoller as Poller;

#[cfg(feature = "poll")]
pub(crate) use poll::PollPoller as Poller;
