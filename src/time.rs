//! Wall-clock helpers for diagnostic log lines and timestamp arithmetic
//!
//! Everything latency-sensitive in this crate deals in raw nanoseconds
//! (`Nanos`); the formatted string form exists only for human-readable log
//! lines and is produced into a caller-owned buffer so the hot path never
//! allocates.

use std::mem;

/// Nanoseconds since the Unix epoch.
pub type Nanos = i64;

/// Nanoseconds per microsecond.
pub const NANOS_PER_MICRO: Nanos = 1_000;
/// Nanoseconds per millisecond.
pub const NANOS_PER_MILLI: Nanos = NANOS_PER_MICRO * 1_000;
/// Nanoseconds per second.
pub const NANOS_PER_SEC: Nanos = NANOS_PER_MILLI * 1_000;

/// Returns the current wall-clock time in nanoseconds since the epoch.
///
/// Reads `CLOCK_REALTIME` directly; the result is used for diagnostic log
/// lines and for comparison against kernel receive timestamps, both of
/// which are expressed on the same clock.
pub fn now_ns() -> Nanos {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    let _rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    debug_assert_eq!(_rc, 0);
    ts.tv_sec as Nanos * NANOS_PER_SEC + ts.tv_nsec as Nanos
}

/// Formats the current local time as `YYYY-MM-DD HH:MM:SS` into `buf`.
///
/// The buffer is cleared and refilled on every call; callers keep one
/// `String` per thread and reuse it so formatting never allocates at
/// steady state.
pub fn time_str(buf: &mut String) -> &str {
    let secs = (now_ns() / NANOS_PER_SEC) as libc::time_t;
    let mut tm: libc::tm = unsafe { mem::zeroed() };
    unsafe { libc::localtime_r(&secs, &mut tm) };

    let mut out = [0u8; 32];
    let n = unsafe {
        libc::strftime(
            out.as_mut_ptr() as *mut libc::c_char,
            out.len(),
            b"%Y-%m-%d %H:%M:%S\0".as_ptr() as *const libc::c_char,
            &tm,
        )
    };

    buf.clear();
    if let Ok(s) = std::str::from_utf8(&out[..n]) {
        buf.push_str(s);
    }
    buf
}
