//! Thin wrappers over the kernel surface the crate consumes.
//!
//! Everything `unsafe` that is not poller-specific lives here:
//! - byte-level `read`/`write`/`close` on raw descriptors,
//! - creation and arming of the wakeup eventfd and the timerfd,
//! - socket calls (`socket`, `bind`, `listen`, `accept4`, `connect`,
//!   `getsockopt`, `getsockname`, `getpeername`, `shutdown`),
//! - conversions between `std::net::SocketAddr` and `sockaddr_storage`.
//!
//! Descriptors created here are returned as [`OwnedFd`] so they are closed
//! on every exit path.

use libc::{
    accept4, bind, c_int, connect, getpeername, getsockname, getsockopt, listen, setsockopt,
    sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socket, socklen_t, AF_INET, AF_INET6,
    IPPROTO_TCP, SHUT_WR, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_STREAM, SOL_SOCKET, SO_ERROR,
    SO_KEEPALIVE, SO_REUSEADDR, SO_REUSEPORT, TCP_NODELAY,
};

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Arming a timerfd with an all-zero `it_value` disarms it, so every delay
/// is clamped to this minimum.
const MIN_TIMER_DELAY: Duration = Duration::from_micros(100);

/// Reads from a file descriptor into the given buffer.
///
/// Returns the number of bytes read, or a negative value on error.
pub(crate) fn sys_read(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) }
}

/// Writes the buffer to a file descriptor.
///
/// Returns the number of bytes written, or a negative value on error.
pub(crate) fn sys_write(fd: RawFd, buffer: &[u8]) -> isize {
    unsafe { libc::write(fd, buffer.as_ptr() as *const _, buffer.len()) }
}

/// Creates the non-blocking, close-on-exec eventfd used as a loop wakeup.
///
/// # Panics
///
/// Panics if the kernel refuses to create the descriptor. A loop without a
/// wakeup cannot honor its cross-thread contract, so this is unrecoverable.
pub(crate) fn create_eventfd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    assert!(fd >= 0, "eventfd failed: {}", io::Error::last_os_error());
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Creates the monotonic, non-blocking, close-on-exec timerfd that backs
/// the timer queue.
///
/// # Panics
///
/// Panics if the kernel refuses to create the descriptor.
pub(crate) fn create_timerfd() -> OwnedFd {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    assert!(
        fd >= 0,
        "timerfd_create failed: {}",
        io::Error::last_os_error()
    );
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Arms the timerfd to fire once at `when`.
///
/// The delay is clamped to a 100 microsecond minimum; a zero `it_value`
/// would disarm the descriptor instead of firing it immediately.
pub(crate) fn reset_timerfd(fd: RawFd, when: Instant) {
    let mut delay = when.saturating_duration_since(Instant::now());
    if delay < MIN_TIMER_DELAY {
        delay = MIN_TIMER_DELAY;
    }

    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as _,
        },
    };

    let rc = unsafe { libc::timerfd_settime(fd, 0, &new_value, std::ptr::null_mut()) };
    if rc != 0 {
        log::error!("timerfd_settime failed: {}", io::Error::last_os_error());
    }
}

/// Drains the fire count from an expired timerfd.
///
/// The count itself is discarded; over-counts are tolerated because the
/// timer queue derives expirations from the clock, not from the count. A
/// short read (signal landing mid-read) is logged and dropped.
pub(crate) fn read_timerfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    let n = sys_read(fd, &mut buf);
    if n != 8 {
        log::error!("timerfd read returned {n} bytes instead of 8");
    } else {
        log::trace!("timerfd fired {} time(s)", u64::from_ne_bytes(buf));
    }
}

/// Creates a non-blocking, close-on-exec TCP socket of the given family.
pub(crate) fn sys_socket(domain: c_int) -> io::Result<OwnedFd> {
    let fd = unsafe {
        socket(
            domain,
            SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC,
            IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Binds a socket to an address.
pub(crate) fn sys_bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);
    let rc = unsafe { bind(fd, &storage as *const _ as *const sockaddr, len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Marks a socket as listening.
pub(crate) fn sys_listen(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { listen(fd, libc::SOMAXCONN) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Accepts one pending connection with `accept4`.
///
/// The flags variant leaves no window between accepting the descriptor and
/// marking it non-blocking and close-on-exec.
pub(crate) fn sys_accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let connfd = unsafe {
        accept4(
            fd,
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
            SOCK_NONBLOCK | SOCK_CLOEXEC,
        )
    };

    if connfd < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = storage_to_socketaddr(&storage)?;
    Ok((unsafe { OwnedFd::from_raw_fd(connfd) }, addr))
}

/// Initiates a connection on a non-blocking socket.
///
/// `EINPROGRESS` is reported as an error; the caller decides whether to wait
/// for writability and re-check with [`sys_socket_error`].
pub(crate) fn sys_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);
    let rc = unsafe { connect(fd, &storage as *const _ as *const sockaddr, len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Shuts down the write half of a socket.
pub(crate) fn sys_shutdown_write(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::shutdown(fd, SHUT_WR) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Reads and clears `SO_ERROR`.
///
/// Returns the pending errno, or the `getsockopt` errno if even that fails.
pub(crate) fn sys_socket_error(fd: RawFd) -> i32 {
    let mut optval: c_int = 0;
    let mut optlen = mem::size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut optval as *mut _ as *mut _,
            &mut optlen,
        )
    };

    if rc < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        optval
    }
}

/// Sets a boolean `int` socket option.
pub(crate) fn sys_set_sockopt(fd: RawFd, level: c_int, name: c_int, on: bool) -> io::Result<()> {
    let value: c_int = on as c_int;
    let rc = unsafe {
        setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const _,
            mem::size_of::<c_int>() as socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn sys_set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    sys_set_sockopt(fd, SOL_SOCKET, SO_REUSEADDR, on)
}

pub(crate) fn sys_set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    sys_set_sockopt(fd, SOL_SOCKET, SO_REUSEPORT, on)
}

pub(crate) fn sys_set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    sys_set_sockopt(fd, IPPROTO_TCP, TCP_NODELAY, on)
}

pub(crate) fn sys_set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    sys_set_sockopt(fd, SOL_SOCKET, SO_KEEPALIVE, on)
}

/// Returns the local address of a socket.
pub(crate) fn sys_local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        storage_to_socketaddr(&storage)
    }
}

/// Returns the peer address of a connected socket.
pub(crate) fn sys_peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { getpeername(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        storage_to_socketaddr(&storage)
    }
}

/// Converts a `sockaddr_storage` to a Rust `SocketAddr`.
pub(crate) fn storage_to_socketaddr(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        AF_INET => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);

            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }

        AF_INET6 => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);

            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }

        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Converts a `SocketAddr` to a `sockaddr_storage`.
pub(crate) fn socketaddr_to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }

        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();

            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}
