//! Nonblocking TCP socket with owned scratch buffers
//!
//! A [`TcpSocket`] owns one connection's descriptor plus fixed send and
//! receive scratch buffers, and exposes a single
//! [`send_and_recv`](TcpSocket::send_and_recv) tick: at most one
//! `recvmsg` (carrying the kernel arrival timestamp) followed by a drain
//! of whatever the application queued with [`send`](TcpSocket::send).
//! Nothing allocates at steady state: the buffers are sized once at
//! construction and reused for the life of the connection.
//!
//! # Callback model
//!
//! The receive callback is a shared function object
//! (`Rc<RefCell<dyn FnMut>>`) installed after the socket exists, so it
//! can never capture a dangling reference to a socket that later moved.
//! A server installs one callback shared across every accepted socket;
//! stand-alone client sockets keep the logging default until the
//! application overrides it.

use std::cell::RefCell;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::config::{self, SocketConfig};
use crate::logger::Logger;
use crate::raw;
use crate::time::{Nanos, now_ns, time_str};

/// Default send/receive scratch capacity per socket (64 MiB).
pub const TCP_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Largest slice offered to one `send` call; a burst larger than this is
/// split and the kernel is told more follows (`MSG_MORE`).
const SEND_CHUNK: usize = 1 << 20;

/// Receive callback: invoked once per successful `recvmsg` with the
/// socket and the kernel arrival time (0 when the kernel attached none).
pub type RecvCallback = Rc<RefCell<dyn FnMut(&mut TcpSocket, Nanos)>>;

/// One TCP connection: descriptor, scratch buffers, and receive callback.
pub struct TcpSocket {
    fd: RawFd,
    send_buffer: Box<[u8]>,
    next_send_valid_index: usize,
    rcv_buffer: Box<[u8]>,
    next_rcv_valid_index: usize,
    send_disconnected: bool,
    recv_disconnected: bool,
    local: SocketAddrV4,
    recv_callback: Option<RecvCallback>,
    logger: Rc<Logger>,
    time_buf: String,
}

impl TcpSocket {
    /// Creates an unconnected socket with the default 64 MiB scratch
    /// buffers.
    pub fn new(logger: Rc<Logger>) -> Self {
        Self::with_buffer_size(logger, TCP_BUFFER_SIZE)
    }

    /// Creates an unconnected socket with `buffer_size` bytes of send and
    /// receive scratch each.
    pub fn with_buffer_size(logger: Rc<Logger>, buffer_size: usize) -> Self {
        let cb_logger = Rc::clone(&logger);
        let default_callback: RecvCallback =
            Rc::new(RefCell::new(move |socket: &mut TcpSocket, rx_time: Nanos| {
                let mut time_buf = String::new();
                cb_logger.log(
                    "TcpSocket::recv() % socket:% len:% rx:%\n",
                    &[
                        time_str(&mut time_buf).into(),
                        socket.fd().into(),
                        socket.received().len().into(),
                        rx_time.into(),
                    ],
                );
            }));

        Self {
            fd: -1,
            send_buffer: vec![0u8; buffer_size].into_boxed_slice(),
            next_send_valid_index: 0,
            rcv_buffer: vec![0u8; buffer_size].into_boxed_slice(),
            next_rcv_valid_index: 0,
            send_disconnected: false,
            recv_disconnected: false,
            local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            recv_callback: Some(default_callback),
            logger,
            time_buf: String::new(),
        }
    }

    /// Wraps an already-accepted descriptor (server side).
    pub(crate) fn from_fd(fd: RawFd, logger: Rc<Logger>, buffer_size: usize) -> Self {
        let mut socket = Self::with_buffer_size(logger, buffer_size);
        socket.fd = fd;
        socket.local =
            raw::local_addr(fd).unwrap_or_else(|_| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        socket
    }

    /// Creates the descriptor through the socket factory and starts a
    /// connect (or enters the listening state when `is_listening`).
    ///
    /// Always nonblocking with kernel timestamping; a previous descriptor
    /// on this socket is closed first. Returns the new descriptor.
    pub fn connect(
        &mut self,
        ip: &str,
        iface: &str,
        port: u16,
        is_listening: bool,
    ) -> io::Result<RawFd> {
        self.destroy();
        let cfg = SocketConfig::tcp(ip, iface, port, is_listening);
        let fd = config::create_socket(&self.logger, &cfg)?;
        self.fd = fd;
        self.local =
            raw::local_addr(fd).unwrap_or_else(|_| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        self.send_disconnected = false;
        self.recv_disconnected = false;
        Ok(fd)
    }

    /// Queues `data` behind any bytes already pending; nothing touches
    /// the wire until the next [`send_and_recv`](Self::send_and_recv)
    /// tick. Zero-length sends succeed silently.
    ///
    /// # Panics
    ///
    /// Panics when the pending bytes would exceed the send scratch;
    /// callers size the scratch so this cannot happen at steady state.
    pub fn send(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let end = self.next_send_valid_index + data.len();
        assert!(
            end <= self.send_buffer.len(),
            "send scratch overflow: {} pending + {} new > {} capacity",
            self.next_send_valid_index,
            data.len(),
            self.send_buffer.len()
        );
        self.send_buffer[self.next_send_valid_index..end].copy_from_slice(data);
        self.next_send_valid_index = end;
    }

    /// One poll tick: at most one `recvmsg`, then a drain of pending
    /// sends. Returns true iff bytes were received.
    ///
    /// Received bytes accumulate in the receive scratch until the
    /// callback consumes them ([`consume`](Self::consume)); the callback
    /// runs synchronously on the calling thread with the kernel arrival
    /// time of this `recvmsg` (0 when absent).
    pub fn send_and_recv(&mut self) -> bool {
        let mut received = false;

        if self.fd >= 0 && self.next_rcv_valid_index < self.rcv_buffer.len() {
            let start = self.next_rcv_valid_index;
            match raw::recv_with_timestamp(self.fd, &mut self.rcv_buffer[start..]) {
                Ok(Some((n, kernel_time))) if n > 0 => {
                    self.next_rcv_valid_index += n;
                    received = true;
                    let user_time = now_ns();
                    self.logger.log(
                        "TcpSocket::read() % socket:% len:% utime:% ktime:% diff:%\n",
                        &[
                            time_str(&mut self.time_buf).into(),
                            self.fd.into(),
                            self.next_rcv_valid_index.into(),
                            user_time.into(),
                            kernel_time.into(),
                            (user_time - kernel_time).into(),
                        ],
                    );
                    self.dispatch_recv(kernel_time);
                }
                // Nothing ready, or an orderly zero-byte shutdown; the
                // poller surfaces the hang-up separately.
                Ok(_) => {}
                Err(_) => {
                    self.recv_disconnected = true;
                }
            }
        }

        self.flush_sends();
        received
    }

    /// Valid received bytes not yet consumed by the application.
    pub fn received(&self) -> &[u8] {
        &self.rcv_buffer[..self.next_rcv_valid_index]
    }

    /// Discards the first `n` received bytes, shifting the remainder to
    /// the front of the scratch.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the valid window.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.next_rcv_valid_index,
            "consume({}) exceeds {} valid bytes",
            n,
            self.next_rcv_valid_index
        );
        self.rcv_buffer.copy_within(n..self.next_rcv_valid_index, 0);
        self.next_rcv_valid_index -= n;
    }

    /// Installs the receive callback, replacing the logging default.
    pub fn set_recv_callback(&mut self, callback: RecvCallback) {
        self.recv_callback = Some(callback);
    }

    /// The underlying descriptor, or -1 when closed.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Local address recorded at connect/accept time.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// True once a send hit a non-transient error; the server evicts the
    /// socket on its next poll.
    pub fn is_send_disconnected(&self) -> bool {
        self.send_disconnected
    }

    /// True once a receive hit a non-transient error.
    pub fn is_recv_disconnected(&self) -> bool {
        self.recv_disconnected
    }

    fn dispatch_recv(&mut self, kernel_time: Nanos) {
        // Take the callback out for the duration of the call so it can
        // receive `&mut self` without aliasing.
        if let Some(callback) = self.recv_callback.take() {
            (&mut *callback.borrow_mut())(self, kernel_time);
            if self.recv_callback.is_none() {
                self.recv_callback = Some(callback);
            }
        }
    }

    /// Drains pending send bytes with nonblocking sends, keeping any
    /// unsent remainder for the next tick.
    fn flush_sends(&mut self) {
        if self.fd < 0 || self.next_send_valid_index == 0 {
            return;
        }
        let pending = self.next_send_valid_index;
        let mut sent = 0usize;
        while sent < pending {
            let end = pending.min(sent + SEND_CHUNK);
            let more = end < pending;
            match raw::send_nonblocking(self.fd, &self.send_buffer[sent..end], more) {
                Ok(Some(0)) => break,
                Ok(Some(n)) => {
                    self.logger.log(
                        "TcpSocket::send() % socket:% len:%\n",
                        &[
                            time_str(&mut self.time_buf).into(),
                            self.fd.into(),
                            n.into(),
                        ],
                    );
                    sent += n;
                }
                // Kernel buffer full; the remainder goes out next tick.
                Ok(None) => break,
                Err(_) => {
                    self.send_disconnected = true;
                    break;
                }
            }
        }
        if sent > 0 {
            // A partial drain shifts the remainder forward instead of
            // discarding it.
            self.send_buffer.copy_within(sent..pending, 0);
        }
        self.next_send_valid_index = pending - sent;
    }

    fn destroy(&mut self) {
        if self.fd >= 0 {
            raw::close(self.fd);
            self.fd = -1;
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn test_logger(name: &str) -> (tempfile::TempDir, Rc<Logger>) {
        let dir = tempfile::tempdir().unwrap();
        let logger = Rc::new(Logger::with_queue_size(dir.path().join(name), 65536));
        (dir, logger)
    }

    #[test]
    fn test_send_queues_bytes() {
        let (_dir, logger) = test_logger("queue.log");
        let mut socket = TcpSocket::with_buffer_size(logger, 64);
        socket.send(b"abc");
        socket.send(b"");
        socket.send(b"de");
        assert_eq!(socket.next_send_valid_index, 5);
        assert_eq!(&socket.send_buffer[..5], b"abcde");
    }

    #[test]
    #[should_panic(expected = "send scratch overflow")]
    fn test_send_overflow_is_fatal() {
        let (_dir, logger) = test_logger("overflow.log");
        let mut socket = TcpSocket::with_buffer_size(logger, 4);
        socket.send(b"abcde");
    }

    #[test]
    fn test_consume_shifts_window() {
        let (_dir, logger) = test_logger("consume.log");
        let mut socket = TcpSocket::with_buffer_size(logger, 16);
        socket.rcv_buffer[..5].copy_from_slice(b"hello");
        socket.next_rcv_valid_index = 5;
        socket.consume(2);
        assert_eq!(socket.received(), b"llo");
        socket.consume(3);
        assert_eq!(socket.received(), b"");
    }

    #[test]
    fn test_loopback_exchange_with_kernel_timestamp_field() {
        let (_dir, logger) = test_logger("loopback.log");

        let mut listener = TcpSocket::with_buffer_size(Rc::clone(&logger), 4096);
        listener.connect("127.0.0.1", "", 0, true).unwrap();
        let port = listener.local_addr().port();

        let mut client = TcpSocket::with_buffer_size(Rc::clone(&logger), 4096);
        client.connect("127.0.0.1", "", port, false).unwrap();
        client.send(b"ping");

        let seen: Rc<RefCell<Vec<(usize, Nanos)>>> = Rc::new(RefCell::new(Vec::new()));

        let mut accepted: Option<TcpSocket> = None;
        for _ in 0..500 {
            if accepted.is_none() {
                if let Some((fd, _peer)) = raw::accept(listener.fd()).unwrap() {
                    raw::set_nonblocking(fd).unwrap();
                    raw::set_nodelay(fd).unwrap();
                    raw::set_so_timestamp(fd).unwrap();
                    let mut socket =
                        TcpSocket::from_fd(fd, Rc::clone(&logger), 4096);
                    let seen_cb = Rc::clone(&seen);
                    socket.set_recv_callback(Rc::new(RefCell::new(
                        move |s: &mut TcpSocket, rx_time: Nanos| {
                            seen_cb.borrow_mut().push((s.received().len(), rx_time));
                        },
                    )));
                    accepted = Some(socket);
                }
            }
            client.send_and_recv();
            if let Some(socket) = accepted.as_mut() {
                socket.send_and_recv();
                if socket.received() == b"ping" {
                    break;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }

        let server_side = accepted.expect("no connection accepted");
        assert_eq!(server_side.received(), b"ping");
        let seen = seen.borrow();
        assert!(!seen.is_empty());
        for &(len, rx_time) in seen.iter() {
            assert!(len > 0);
            // SO_TIMESTAMP was enabled before the first recvmsg, so the
            // kernel arrival time is present and nonzero.
            assert!(rx_time > 0);
        }
        assert!(!server_side.is_recv_disconnected());
        assert!(!server_side.is_send_disconnected());
    }

    #[test]
    fn test_send_error_sets_disconnect_flag() {
        let (_dir, logger) = test_logger("disc.log");
        let mut socket = TcpSocket::with_buffer_size(logger, 64);
        // A fresh unconnected TCP fd: send() fails with EPIPE/ENOTCONN.
        socket.fd = raw::socket(false).unwrap();
        raw::set_nonblocking(socket.fd).unwrap();
        socket.send(b"data");
        socket.send_and_recv();
        assert!(socket.is_send_disconnected());
    }
}
