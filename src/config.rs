//! Declarative socket configuration and the socket factory
//!
//! A [`SocketConfig`] describes the socket an application wants (address,
//! transport, blocking mode, listener vs. initiator, TTL, kernel
//! timestamping) and [`create_socket`] turns the description into a
//! configured file descriptor, applying each option in a fixed order and
//! logging the first step that fails.
//!
//! The factory is deliberately IPv4-only: the systems this crate targets
//! speak IPv4 on dedicated exchange links.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::fd::RawFd;

use crate::logger::Logger;
use crate::raw;
use crate::time::time_str;

/// Accept-queue depth for listening TCP sockets.
pub const MAX_TCP_SERVER_BACKLOG: i32 = 1024;

/// Declarative description of a socket for [`create_socket`]
///
/// Field semantics follow the factory's application order; unset-style
/// values (`ip` empty, `ttl` zero) disable the corresponding step.
#[derive(Clone, Debug, PartialEq)]
pub struct SocketConfig {
    /// Explicit IPv4 literal or hostname. Empty means "resolve the first
    /// IPv4 address of `iface` instead".
    pub ip: String,

    /// OS interface name (`"lo"`, `"eth0"`); consulted only when `ip` is
    /// empty.
    pub iface: String,

    /// TCP/UDP port. Zero asks the kernel for an ephemeral port when
    /// binding.
    pub port: u16,

    /// Datagram (UDP) instead of stream (TCP).
    pub is_udp: bool,

    /// When `false` the descriptor is made nonblocking and, for TCP,
    /// Nagle's algorithm is disabled.
    pub is_blocking: bool,

    /// When `true` the address is bound with `SO_REUSEADDR` and a TCP
    /// socket enters the listening state; when `false` the factory
    /// initiates a connect (accepting `EINPROGRESS` under nonblocking).
    pub is_listening: bool,

    /// Nonzero enables `IP_TTL` (unicast) or `IP_MULTICAST_TTL`
    /// (class-D destination) on UDP sockets.
    pub ttl: u32,

    /// Enables `SO_TIMESTAMP` so `recvmsg` reports the kernel arrival
    /// time as ancillary data.
    pub needs_timestamp: bool,
}

impl Default for SocketConfig {
    /// A blocking TCP initiator with no TTL override and no kernel
    /// timestamping.
    fn default() -> Self {
        Self {
            ip: String::new(),
            iface: String::new(),
            port: 0,
            is_udp: false,
            is_blocking: true,
            is_listening: false,
            ttl: 0,
            needs_timestamp: false,
        }
    }
}

impl SocketConfig {
    /// The nonblocking, kernel-timestamped TCP shape used by
    /// [`TcpSocket::connect`](crate::tcp::TcpSocket::connect) for both
    /// listeners and initiators.
    pub fn tcp(ip: &str, iface: &str, port: u16, is_listening: bool) -> Self {
        Self {
            ip: ip.to_string(),
            iface: iface.to_string(),
            port,
            is_udp: false,
            is_blocking: false,
            is_listening,
            ttl: 0,
            needs_timestamp: true,
        }
    }
}

/// Builds a configured descriptor from a [`SocketConfig`].
///
/// Application order: resolve address → `socket()` → nonblocking (+
/// `TCP_NODELAY` for TCP) → `connect()` for initiators → `SO_REUSEADDR`
/// + `bind()` (+ `listen()` for TCP) for listeners → TTL for UDP →
/// `SO_TIMESTAMP`. The first failing step emits one log line naming the
/// step and the OS error, the descriptor is closed, and the error is
/// returned.
///
/// `EAGAIN`/`EWOULDBLOCK`/`EINPROGRESS` from a nonblocking `connect()`
/// are not failures; the caller's event loop picks the socket up once the
/// handshake completes.
pub fn create_socket(logger: &Logger, cfg: &SocketConfig) -> io::Result<RawFd> {
    let ip = resolve_ip(logger, cfg)?;
    let addr = SocketAddrV4::new(ip, cfg.port);

    let ip_text = ip.to_string();
    let mut time_buf = String::new();
    logger.log(
        "create_socket() % ip:% iface:% port:% udp:% blocking:% listening:% ttl:% timestamp:%\n",
        &[
            time_str(&mut time_buf).into(),
            ip_text.as_str().into(),
            cfg.iface.as_str().into(),
            u32::from(cfg.port).into(),
            cfg.is_udp.into(),
            cfg.is_blocking.into(),
            cfg.is_listening.into(),
            cfg.ttl.into(),
            cfg.needs_timestamp.into(),
        ],
    );

    let fd = raw::socket(cfg.is_udp).map_err(|e| {
        log_failure(logger, "socket()", &e);
        e
    })?;

    // From here on every failure must release the descriptor.
    let fail = |step: &str, e: io::Error| -> io::Error {
        log_failure(logger, step, &e);
        raw::close(fd);
        e
    };

    if !cfg.is_blocking {
        raw::set_nonblocking(fd).map_err(|e| fail("set_nonblocking()", e))?;
        if !cfg.is_udp {
            raw::set_nodelay(fd).map_err(|e| fail("set_nodelay()", e))?;
        }
    }

    if !cfg.is_listening {
        match raw::connect(fd, addr) {
            Ok(()) => {}
            Err(ref e) if raw::would_block(e) => {}
            Err(e) => return Err(fail("connect()", e)),
        }
    } else {
        raw::set_reuseaddr(fd).map_err(|e| fail("set_reuseaddr()", e))?;
        raw::bind(fd, addr).map_err(|e| fail("bind()", e))?;
        if !cfg.is_udp {
            raw::listen(fd, MAX_TCP_SERVER_BACKLOG).map_err(|e| fail("listen()", e))?;
        }
    }

    if cfg.is_udp && cfg.ttl != 0 {
        if ip.is_multicast() {
            raw::set_mcast_ttl(fd, cfg.ttl).map_err(|e| fail("set_mcast_ttl()", e))?;
        } else {
            raw::set_ttl(fd, cfg.ttl).map_err(|e| fail("set_ttl()", e))?;
        }
    }

    if cfg.needs_timestamp {
        raw::set_so_timestamp(fd).map_err(|e| fail("set_so_timestamp()", e))?;
    }

    Ok(fd)
}

fn log_failure(logger: &Logger, step: &str, err: &io::Error) {
    let msg = err.to_string();
    logger.log(
        "create_socket(): % failed. error:%\n",
        &[step.into(), msg.as_str().into()],
    );
}

/// Picks the concrete IPv4 address the factory will use.
///
/// Empty `ip` resolves through the interface name. A dotted-quad literal
/// is used verbatim; anything else is resolved as a hostname, taking the
/// first IPv4 result.
fn resolve_ip(logger: &Logger, cfg: &SocketConfig) -> io::Result<Ipv4Addr> {
    if cfg.ip.is_empty() {
        return raw::iface_ipv4(&cfg.iface).ok_or_else(|| {
            logger.log(
                "create_socket(): no IPv4 address on interface %\n",
                &[cfg.iface.as_str().into()],
            );
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no IPv4 address on interface '{}'", cfg.iface),
            )
        });
    }

    if let Ok(ip) = cfg.ip.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let resolved = (cfg.ip.as_str(), cfg.port).to_socket_addrs().map_err(|e| {
        log_failure(logger, "resolve()", &e);
        e
    })?;
    for addr in resolved {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    logger.log(
        "create_socket(): no IPv4 address for host %\n",
        &[cfg.ip.as_str().into()],
    );
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("no IPv4 address for host '{}'", cfg.ip),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger(name: &str) -> (tempfile::TempDir, Logger) {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::with_queue_size(dir.path().join(name), 4096);
        (dir, logger)
    }

    #[test]
    fn test_default_config() {
        let cfg = SocketConfig::default();
        assert!(cfg.ip.is_empty());
        assert!(cfg.is_blocking);
        assert!(!cfg.is_listening);
        assert_eq!(cfg.ttl, 0);
        assert!(!cfg.needs_timestamp);
    }

    #[test]
    fn test_tcp_listener_on_loopback() {
        let (_dir, logger) = test_logger("listener.log");
        let cfg = SocketConfig::tcp("127.0.0.1", "", 0, true);
        let fd = create_socket(&logger, &cfg).unwrap();
        let local = raw::local_addr(fd).unwrap();
        assert_eq!(*local.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
        raw::close(fd);
    }

    #[test]
    fn test_udp_socket_with_ttl() {
        let (_dir, logger) = test_logger("udp.log");
        let cfg = SocketConfig {
            ip: "127.0.0.1".to_string(),
            is_udp: true,
            is_blocking: false,
            is_listening: true,
            ttl: 8,
            ..SocketConfig::default()
        };
        let fd = create_socket(&logger, &cfg).unwrap();
        assert!(fd >= 0);
        raw::close(fd);
    }

    #[test]
    fn test_missing_iface_is_an_error() {
        let (_dir, logger) = test_logger("noiface.log");
        let cfg = SocketConfig {
            iface: "definitely-not-an-iface".to_string(),
            ..SocketConfig::default()
        };
        assert!(create_socket(&logger, &cfg).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_listener_from_iface_name() {
        let (_dir, logger) = test_logger("iface.log");
        let cfg = SocketConfig::tcp("", "lo", 0, true);
        let fd = create_socket(&logger, &cfg).unwrap();
        let local = raw::local_addr(fd).unwrap();
        assert_eq!(*local.ip(), Ipv4Addr::LOCALHOST);
        raw::close(fd);
    }
}
