use crate::sys;

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// An owned, non-blocking, close-on-exec TCP socket.
///
/// This is the descriptor-level helper the connection layers build on: it
/// owns the fd (closing it on drop), exposes the listen/accept/connect
/// calls with their error policy applied, and carries the common option
/// setters. It knows nothing about event loops; to watch the descriptor,
/// hand [`fd`](Self::fd) to a [`Channel`](crate::Channel).
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking TCP socket of the same family as `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the kernel refuses the descriptor; a server that cannot
    /// create its socket has nothing to fall back to.
    pub fn tcp(addr: &SocketAddr) -> Socket {
        let domain = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        match sys::sys_socket(domain) {
            Ok(fd) => Socket { fd },
            Err(err) => panic!("socket creation failed: {err}"),
        }
    }

    /// Wraps an already-created descriptor.
    pub fn from_fd(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Binds to `addr`.
    ///
    /// # Panics
    ///
    /// Panics on failure: a bind error (address in use, permission) is a
    /// deployment problem, not a runtime condition to retry.
    pub fn bind(&self, addr: &SocketAddr) {
        if let Err(err) = sys::sys_bind(self.fd(), addr) {
            panic!("bind to {addr} failed: {err}");
        }
    }

    /// Starts listening.
    ///
    /// # Panics
    ///
    /// Panics on failure, for the same reason as [`bind`](Self::bind).
    pub fn listen(&self) {
        if let Err(err) = sys::sys_listen(self.fd()) {
            panic!("listen failed: {err}");
        }
    }

    /// Accepts one pending connection.
    ///
    /// The accepted socket is non-blocking and close-on-exec from birth
    /// (`accept4`). Transient errors (`EAGAIN`, `ECONNABORTED`, `EINTR`,
    /// `EPROTO`, `EPERM`, and the fd-limit `EMFILE`) are logged and
    /// returned for the caller to ride out; anything else indicates a
    /// broken program state and panics.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        match sys::sys_accept(self.fd()) {
            Ok((fd, addr)) => Ok((Socket { fd }, addr)),
            Err(err) => {
                match err.raw_os_error() {
                    Some(libc::EAGAIN)
                    | Some(libc::ECONNABORTED)
                    | Some(libc::EINTR)
                    | Some(libc::EPROTO)
                    | Some(libc::EPERM)
                    | Some(libc::EMFILE) => {
                        // EMFILE means the process is out of descriptors; a
                        // higher layer may keep a spare fd to shed load.
                        log::error!("accept failed: {err}");
                        Err(err)
                    }
                    _ => panic!("unexpected accept error: {err}"),
                }
            }
        }
    }

    /// Initiates a connection. On a non-blocking socket the usual result
    /// is `EINPROGRESS`; wait for writability and check
    /// [`error`](Self::error) to learn the outcome.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        sys::sys_connect(self.fd(), addr)
    }

    /// Shuts down the writing half, leaving the read side open for the
    /// peer's remaining data.
    pub fn shutdown_write(&self) {
        if let Err(err) = sys::sys_shutdown_write(self.fd()) {
            log::error!("shutdown write failed: {err}");
        }
    }

    /// Reads and clears the pending socket error (`SO_ERROR`). Zero means
    /// none; the main use is diagnosing a non-blocking connect once the
    /// socket turns writable.
    pub fn error(&self) -> i32 {
        get_socket_error(self.fd())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sys::sys_local_addr(self.fd())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sys::sys_peer_addr(self.fd())
    }

    /// Whether the socket is connected to itself, which a loopback connect
    /// to a kernel-chosen ephemeral port can produce. Reported, not
    /// rejected; the connection layer decides what to do about it.
    pub fn is_self_connect(&self) -> bool {
        is_self_connect(self.fd())
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        sys::sys_set_reuse_addr(self.fd(), on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        sys::sys_set_reuse_port(self.fd(), on)
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        sys::sys_set_tcp_nodelay(self.fd(), on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        sys::sys_set_keep_alive(self.fd(), on)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Reads and clears `SO_ERROR` on an arbitrary descriptor.
pub fn get_socket_error(fd: RawFd) -> i32 {
    sys::sys_socket_error(fd)
}

/// Whether `fd` is a TCP socket connected to itself: same address and port
/// on both ends.
pub fn is_self_connect(fd: RawFd) -> bool {
    match (sys::sys_local_addr(fd), sys::sys_peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}
