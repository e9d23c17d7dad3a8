//! # Tickflow - Low-Latency Networking and Concurrency Toolkit
//!
//! Tickflow provides the foundation primitives of a trading-style system
//! where microseconds matter: a wait-free SPSC ring, a fixed-capacity
//! object pool, an asynchronous logger that keeps formatting and file I/O
//! off the hot path, and an edge-triggered nonblocking TCP server/socket
//! pair with kernel-timestamped reads.
//!
//! ## Key Properties
//!
//! - **Zero allocation at steady state**: rings, pools and socket scratch
//!   buffers are sized once at construction and reused forever
//! - **Wait-free hand-offs**: the SPSC ring publishes with a single
//!   release/acquire pair; no locks, no CAS loops
//! - **Cooperative event loop**: the server polls with a zero timeout and
//!   never blocks in the kernel; all socket I/O is nonblocking
//! - **Kernel timestamps**: `recvmsg` control messages surface the
//!   nanosecond arrival time of inbound bytes to the receive callback
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use tickflow::{Logger, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let logger = Rc::new(Logger::new("/tmp/server.log"));
//!     let mut server = TcpServer::new(Rc::clone(&logger))?;
//!     server.listen("lo", 9001)?;
//!
//!     loop {
//!         server.poll()?;
//!         server.send_and_recv();
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! The toolkit is layered leaves-first:
//!
//! - [`spsc`]: bounded lock-free single-producer/single-consumer ring
//! - [`pool`]: fixed-capacity, index-stable object pool
//! - [`logger`]: asynchronous logger draining through an SPSC ring
//! - [`raw`]: thin libc wrappers for socket syscalls and `recvmsg`
//! - [`config`]: declarative socket description + factory
//! - [`tcp`]: one connection's descriptor and scratch buffers
//! - [`server`]: edge-triggered readiness multiplexer
//! - [`affinity`]: CPU pinning and named-thread spawning
//! - [`time`]: nanosecond clock and time-string formatting
//!
//! ## Threading Model
//!
//! Every structure here is single-thread-owned: one thread drives a
//! server, one thread produces into a ring, one thread (the logger's
//! drainer) consumes it. The SPSC ring is the only cross-thread seam,
//! and its two endpoints are `Send` handles owned by exactly one thread
//! each.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

/// CPU affinity and thread spawning utilities
pub mod affinity;
/// Declarative socket configuration and the socket factory
pub mod config;
/// Asynchronous logger with a lock-free hand-off to a drainer thread
pub mod logger;
/// Fixed-capacity object pool with constant-time allocate/deallocate
pub mod pool;
/// Low-level socket operations
pub mod raw;
/// Edge-triggered TCP connection multiplexer
pub mod server;
/// Bounded lock-free single-producer / single-consumer ring
pub mod spsc;
/// Nonblocking TCP socket with owned scratch buffers
pub mod tcp;
/// Wall-clock helpers for diagnostics and timestamp arithmetic
pub mod time;

/// Convenience re-exports for common types and functions
///
/// These re-exports provide easy access to the most commonly used
/// types without requiring full module paths.
pub use config::{SocketConfig, create_socket};
pub use logger::{LogArg, LogElement, Logger};
pub use pool::{MemoryPool, PoolHandle};
pub use server::TcpServer;
pub use spsc::{Consumer, Producer, spsc_ring};
pub use tcp::{TcpSocket, TCP_BUFFER_SIZE};

// Re-export the collaborator utilities for thread and clock management
pub use affinity::{pin_to_cpu, spawn_pinned};
pub use time::{Nanos, now_ns, time_str};
