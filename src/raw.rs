//! Low-level socket operations
//!
//! Thin safe wrappers over the libc socket surface used by the factory,
//! the TCP socket and the server: creation, option setting, address
//! conversion, the `recvmsg` path that surfaces kernel receive timestamps,
//! and the nonblocking `send` path. Every wrapper translates a failing
//! return into `io::Error::last_os_error()` and leaves policy (what is
//! fatal, what is retried) to the caller.
//!
//! # Safety
//!
//! The raw syscalls and sockaddr casts are encapsulated here behind safe
//! functions; callers pass owned buffers and descriptors they control.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;
use std::ptr;

use crate::time::{NANOS_PER_MICRO, NANOS_PER_SEC, Nanos};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SEND_BASE_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
        const SEND_MORE_FLAG: libc::c_int = libc::MSG_MORE;
    } else {
        // The BSDs have no MSG_MORE and use SO_NOSIGPIPE instead of
        // MSG_NOSIGNAL.
        const SEND_BASE_FLAGS: libc::c_int = libc::MSG_DONTWAIT;
        const SEND_MORE_FLAG: libc::c_int = 0;
    }
}

/// Creates an IPv4 socket: TCP stream or UDP datagram.
pub fn socket(is_udp: bool) -> io::Result<RawFd> {
    let (ty, proto) = if is_udp {
        (libc::SOCK_DGRAM, libc::IPPROTO_UDP)
    } else {
        (libc::SOCK_STREAM, libc::IPPROTO_TCP)
    };
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let ty = ty | libc::SOCK_CLOEXEC;
    let fd = unsafe { libc::socket(libc::AF_INET, ty, proto) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Set socket non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK != 0 {
            return Ok(());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Disable TCP Nagle algorithm for low latency
pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

/// Allow rebinding a recently used local address
pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

/// Set unicast IP TTL
pub fn set_ttl(fd: RawFd, ttl: u32) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TTL, ttl as i32)
}

/// Set multicast IP TTL
pub fn set_mcast_ttl(fd: RawFd, ttl: u32) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl as i32)
}

/// Enable SO_TIMESTAMP so recvmsg reports kernel arrival times
pub fn set_so_timestamp(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMP, 1)
}

fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
    let v = val as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &v as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Convert a socket address to its C representation
pub fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as _;
    sa.sin_port = addr.port().to_be();
    // Octets are already network order; keep the byte layout as-is.
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sa
}

/// Convert a C socket address back to the std representation
pub fn from_sockaddr_in(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(sa.sin_port),
    )
}

/// Bind `fd` to `addr`
pub fn bind(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sa = to_sockaddr_in(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Start listening with the given backlog
pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    if unsafe { libc::listen(fd, backlog) } != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Initiate a connect; nonblocking callers accept a would-block result
pub fn connect(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sa = to_sockaddr_in(addr);
    let rc = unsafe {
        libc::connect(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Local address the socket is bound to
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr_in(&sa))
}

/// Accepts one pending connection.
///
/// Returns `Ok(None)` when the accept queue is empty (nonblocking
/// listener), `Ok(Some((fd, peer)))` for a new connection.
pub fn accept(fd: RawFd) -> io::Result<Option<(RawFd, SocketAddrV4)>> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let conn = unsafe { libc::accept(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) };
    if conn < 0 {
        let err = io::Error::last_os_error();
        if would_block(&err) {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some((conn, from_sockaddr_in(&sa))))
}

/// Close a descriptor, ignoring errors (used from drop paths)
pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// True for the transient errnos a nonblocking caller simply retries on
/// the next tick: EAGAIN / EWOULDBLOCK / EINPROGRESS.
pub fn would_block(err: &io::Error) -> bool {
    match err.raw_os_error() {
        // EAGAIN and EWOULDBLOCK alias on Linux but not everywhere.
        Some(code) => {
            code == libc::EAGAIN || code == libc::EWOULDBLOCK || code == libc::EINPROGRESS
        }
        None => false,
    }
}

/// First IPv4 address assigned to the named interface, if any.
pub fn iface_ipv4(iface: &str) -> Option<Ipv4Addr> {
    use std::ffi::CStr;

    unsafe {
        let mut ifap: *mut libc::ifaddrs = ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            return None;
        }
        let mut cur = ifap;
        let mut found = None;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_addr.is_null()
                && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET
                && CStr::from_ptr(ifa.ifa_name).to_string_lossy() == iface
            {
                let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                found = Some(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()));
                break;
            }
            cur = ifa.ifa_next;
        }
        libc::freeifaddrs(ifap);
        found
    }
}

/// One nonblocking `recvmsg` into `buf`, extracting the kernel receive
/// timestamp from the control messages.
///
/// Returns `Ok(None)` when nothing is ready, otherwise the byte count
/// (zero meaning orderly peer shutdown) and the kernel arrival time in
/// nanoseconds, or 0 when the kernel attached no timestamp. The control
/// message list is walked with `CMSG_NXTHDR` until `SCM_TIMESTAMP` is
/// found; the timestamp's position in the list is not assumed.
pub fn recv_with_timestamp(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<(usize, Nanos)>> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // 64 bytes, u64-aligned as cmsghdr requires; enough for one timeval
    // control message plus slack.
    let mut ctrl = [0u64; 8];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1 as _;
    msg.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = mem::size_of_val(&ctrl) as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if would_block(&err) {
            return Ok(None);
        }
        return Err(err);
    }

    let mut kernel_time: Nanos = 0;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_TIMESTAMP {
                let mut tv: libc::timeval = mem::zeroed();
                ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg) as *const u8,
                    &mut tv as *mut libc::timeval as *mut u8,
                    mem::size_of::<libc::timeval>(),
                );
                kernel_time =
                    tv.tv_sec as Nanos * NANOS_PER_SEC + tv.tv_usec as Nanos * NANOS_PER_MICRO;
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Some((n as usize, kernel_time)))
}

/// One nonblocking `send`.
///
/// Returns `Ok(None)` when the kernel send buffer is full; `more` hints
/// that further bytes of the same burst follow immediately (MSG_MORE on
/// Linux). SIGPIPE is always suppressed.
pub fn send_nonblocking(fd: RawFd, data: &[u8], more: bool) -> io::Result<Option<usize>> {
    let flags = SEND_BASE_FLAGS | if more { SEND_MORE_FLAG } else { 0 };
    let n = unsafe { libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), flags) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if would_block(&err) {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(n as usize))
}
