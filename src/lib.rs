//! # eddy
//!
//! **eddy** is a reactor-style event loop library for Linux, a building
//! block for high-throughput TCP servers and clients that register
//! callbacks on I/O readiness instead of blocking on sockets.
//!
//! Each [`EventLoop`] owns one thread and drives everything on it: an
//! epoll (or poll(2)) backed poller, a set of [`Channel`]s binding file
//! descriptors to callbacks, a timerfd-backed timer queue, and an
//! eventfd-backed queue through which any thread can push work onto the
//! loop. Loops in sibling threads run independently; the only shared state
//! between them is the explicit [`LoopHandle`] submission path.
//!
//! Callbacks are cooperative: they run to completion on the loop thread
//! and must never block. Lift blocking work onto another thread and post
//! the result back with [`LoopHandle::run_in_loop`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use eddy::EventLoop;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new();
//! let handle = event_loop.handle();
//!
//! event_loop.run_after(Duration::from_millis(50), move || {
//!     println!("tick");
//!     handle.quit();
//! });
//!
//! event_loop.run();
//! ```
//!
//! ## Modules
//!
//! - [`net`] — descriptor-level socket helpers for the layers above the
//!   loop.

mod reactor;
mod sys;
mod utils;

pub mod net;

pub use reactor::channel::Channel;
pub use reactor::event_loop::EventLoop;
pub use reactor::handle::LoopHandle;
pub use reactor::mask::EventMask;
pub use reactor::timer::TimerId;
