//! Descriptor-level socket helpers.
//!
//! Connection layers above the loop use these to create, bind and accept
//! non-blocking TCP sockets and to diagnose asynchronous connects. The
//! event-loop core itself never touches sockets; its only kernel
//! descriptors are the poller, the wakeup and the timer.

mod socket;

pub use socket::{get_socket_error, is_self_connect, Socket};
