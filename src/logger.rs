//! Asynchronous logger with a lock-free hand-off to a drainer thread
//!
//! Hot-path threads must never format text or touch a file descriptor, so
//! the logger splits the work: callers decompose a log statement into
//! [`LogElement`] records and push them through an SPSC ring; a dedicated
//! drainer thread pops the records, renders them, and writes the file.
//! The push side does no allocation and no blocking I/O.
//!
//! # Format strings
//!
//! [`Logger::log`] walks the format byte by byte: each `%` consumes one
//! positional argument, `%%` emits a literal `%`, and every other byte is
//! forwarded verbatim. Arity mismatches are programmer errors and fatal.
//!
//! # Single producer
//!
//! The ring has exactly one producer; the producer cursor lives behind a
//! `RefCell`, which makes `Logger` non-`Sync`: the compiler rejects any
//! attempt to share one logger across threads. One thread, one logger,
//! one file.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::affinity::spawn_pinned;
use crate::spsc::{Consumer, Producer, spsc_ring};

/// Default ring capacity in elements (~8 Mi).
pub const LOG_QUEUE_SIZE: usize = 8 * 1024 * 1024;

/// One primitive record passed through the logger's ring.
///
/// Strings never travel as a unit: the push side decomposes them into one
/// `Char` element per byte, so every ring slot stays a fixed-size plain
/// value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogElement {
    /// A single raw byte, written to the file verbatim.
    Char(u8),
    /// Signed 32-bit integer, rendered in decimal.
    I32(i32),
    /// Signed 64-bit integer, rendered in decimal.
    I64(i64),
    /// Unsigned 32-bit integer, rendered in decimal.
    U32(u32),
    /// Unsigned 64-bit integer, rendered in decimal.
    U64(u64),
    /// 32-bit float, rendered in shortest round-trip decimal.
    F32(f32),
    /// 64-bit float, rendered in shortest round-trip decimal.
    F64(f64),
}

impl Default for LogElement {
    fn default() -> Self {
        LogElement::Char(0)
    }
}

/// A value acceptable to [`Logger::push`] and [`Logger::log`].
///
/// Scalars map to a single [`LogElement`]; strings and byte slices expand
/// into a stream of `Char` elements. No trailing NUL is appended; Rust
/// strings carry none.
#[derive(Clone, Copy, Debug)]
pub enum LogArg<'a> {
    /// A single primitive element.
    Scalar(LogElement),
    /// A UTF-8 string, pushed byte by byte.
    Str(&'a str),
    /// Raw bytes, pushed byte by byte.
    Bytes(&'a [u8]),
}

macro_rules! impl_scalar_arg {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for LogArg<'_> {
            fn from(v: $ty) -> Self {
                LogArg::Scalar(LogElement::$variant(v))
            }
        })*
    };
}

impl_scalar_arg! {
    u8 => Char,
    i32 => I32,
    i64 => I64,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

impl From<usize> for LogArg<'_> {
    fn from(v: usize) -> Self {
        LogArg::Scalar(LogElement::U64(v as u64))
    }
}

impl From<bool> for LogArg<'_> {
    fn from(v: bool) -> Self {
        LogArg::Scalar(LogElement::I32(v as i32))
    }
}

impl From<LogElement> for LogArg<'_> {
    fn from(el: LogElement) -> Self {
        LogArg::Scalar(el)
    }
}

impl<'a> From<&'a str> for LogArg<'a> {
    fn from(s: &'a str) -> Self {
        LogArg::Str(s)
    }
}

impl<'a> From<&'a [u8]> for LogArg<'a> {
    fn from(b: &'a [u8]) -> Self {
        LogArg::Bytes(b)
    }
}

/// Asynchronous file logger.
///
/// Construction opens the file and starts the drainer thread; drop blocks
/// until every pushed element has been drained, then joins the drainer
/// and closes the file.
///
/// # Examples
///
/// ```no_run
/// use tickflow::logger::Logger;
///
/// let logger = Logger::new("/tmp/app.log");
/// logger.log("connected fd:% in % ms\n", &[7i32.into(), 1.25f64.into()]);
/// ```
pub struct Logger {
    file_path: PathBuf,
    producer: RefCell<Producer<LogElement>>,
    running: Arc<AtomicBool>,
    drainer: Option<thread::JoinHandle<()>>,
}

impl Logger {
    /// Opens `path` for writing and starts the drainer with the default
    /// ring capacity ([`LOG_QUEUE_SIZE`]).
    ///
    /// # Panics
    ///
    /// Failing to open the file or spawn the drainer is fatal: a trading
    /// process without its log is undeployable.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_queue_size(path, LOG_QUEUE_SIZE)
    }

    /// Same as [`new`](Self::new) with an explicit ring capacity.
    ///
    /// Callers size the ring so the producer can never overrun the
    /// drainer at steady state.
    pub fn with_queue_size<P: AsRef<Path>>(path: P, queue_size: usize) -> Self {
        let file_path = path.as_ref().to_path_buf();
        let file = File::create(&file_path).unwrap_or_else(|e| {
            panic!("could not open log file {}: {}", file_path.display(), e)
        });

        let (producer, consumer) = spsc_ring::<LogElement>(queue_size);
        let running = Arc::new(AtomicBool::new(true));
        let drainer_running = Arc::clone(&running);
        let drainer = spawn_pinned(-1, "tickflow-logger", move || {
            drain_loop(consumer, file, drainer_running);
        })
        .unwrap_or_else(|e| panic!("failed to start logger drainer: {}", e));

        Self {
            file_path,
            producer: RefCell::new(producer),
            running,
            drainer: Some(drainer),
        }
    }

    /// Pushes one value into the ring.
    ///
    /// Scalars occupy one slot; strings and byte slices occupy one slot
    /// per byte.
    pub fn push<'a>(&self, value: impl Into<LogArg<'a>>) {
        self.push_arg(value.into());
    }

    /// Writes `fmt` with positional `%` substitutions.
    ///
    /// `%%` emits a literal percent sign and consumes nothing.
    ///
    /// # Panics
    ///
    /// Panics when the number of `%` placeholders and the number of
    /// arguments disagree; an arity mismatch is a bug at the call site,
    /// never data-dependent.
    pub fn log(&self, fmt: &str, args: &[LogArg<'_>]) {
        let bytes = fmt.as_bytes();
        let mut args = args.iter();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                if bytes.get(i + 1) == Some(&b'%') {
                    self.push_element(LogElement::Char(b'%'));
                    i += 2;
                    continue;
                }
                match args.next() {
                    Some(&arg) => self.push_arg(arg),
                    None => panic!("missing arguments to log(): {:?}", fmt),
                }
                i += 1;
                continue;
            }
            self.push_element(LogElement::Char(bytes[i]));
            i += 1;
        }
        assert!(
            args.next().is_none(),
            "extra arguments provided to log(): {:?}",
            fmt
        );
    }

    /// Elements pushed but not yet drained.
    pub fn pending(&self) -> usize {
        self.producer.borrow().size()
    }

    fn push_arg(&self, arg: LogArg<'_>) {
        match arg {
            LogArg::Scalar(el) => self.push_element(el),
            LogArg::Str(s) => {
                for &b in s.as_bytes() {
                    self.push_element(LogElement::Char(b));
                }
            }
            LogArg::Bytes(bytes) => {
                for &b in bytes {
                    self.push_element(LogElement::Char(b));
                }
            }
        }
    }

    fn push_element(&self, el: LogElement) {
        let mut tx = self.producer.borrow_mut();
        *tx.next_write_slot() = el;
        tx.commit_write();
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        eprintln!("flushing and closing logger for {}", self.file_path.display());

        // Wait for the drainer to catch up before asking it to stop, so no
        // record pushed before this drop is lost.
        while self.producer.borrow().size() > 0 {
            thread::sleep(Duration::from_secs(1));
        }
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.drainer.take() {
            let _ = handle.join();
        }
    }
}

fn drain_loop(mut rx: Consumer<LogElement>, file: File, running: Arc<AtomicBool>) {
    let mut out = BufWriter::new(file);
    while running.load(Ordering::Acquire) {
        drain(&mut rx, &mut out);
        if let Err(e) = out.flush() {
            eprintln!("logger: flush failed: {}", e);
        }
        thread::sleep(Duration::from_millis(1));
    }
    // Final sweep for anything pushed between the last drain and the stop
    // flag.
    drain(&mut rx, &mut out);
    if let Err(e) = out.flush() {
        eprintln!("logger: flush failed: {}", e);
    }
}

fn drain(rx: &mut Consumer<LogElement>, out: &mut BufWriter<File>) {
    while let Some(&el) = rx.next_read_slot() {
        if let Err(e) = write_element(out, el) {
            eprintln!("logger: write failed: {}", e);
        }
        rx.commit_read();
    }
}

fn write_element(out: &mut BufWriter<File>, el: LogElement) -> io::Result<()> {
    match el {
        LogElement::Char(b) => out.write_all(&[b]),
        LogElement::I32(v) => write!(out, "{}", v),
        LogElement::I64(v) => write!(out, "{}", v),
        LogElement::U32(v) => write!(out, "{}", v),
        LogElement::U64(v) => write!(out, "{}", v),
        LogElement::F32(v) => write!(out, "{}", v),
        LogElement::F64(v) => write!(out, "{}", v),
    }
}
