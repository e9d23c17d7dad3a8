//! CPU affinity and thread spawning utilities
//!
//! Latency-critical threads are pinned to dedicated cores to avoid context
//! switching and to keep cache locality predictable. This module provides
//! the pinning primitive plus a named-thread spawner used by the logger's
//! drainer and by applications running the server loop.

use std::io;
use std::thread;

/// Pins the calling thread to a specific CPU core
///
/// # Arguments
///
/// * `cpu` - The CPU core number to pin the thread to (0-based indexing)
///
/// # Returns
///
/// `Ok(())` on success, or an `io::Error` if the operation fails
///
/// # Platform Support
///
/// - **Linux/FreeBSD/Android**: uses the `sched_setaffinity` system call
/// - **Other platforms**: no-op (returns success but doesn't pin)
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        return pin_to_cpu_unix(cpu);
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        let _ = cpu;
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn pin_to_cpu_unix(cpu: usize) -> io::Result<()> {
    use libc::{CPU_SET, CPU_ZERO, cpu_set_t, sched_setaffinity};

    if cpu >= 1024 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "CPU number too large (max 1023)",
        ));
    }

    unsafe {
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(cpu, &mut set);

        if sched_setaffinity(0, std::mem::size_of::<cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

/// Spawns a named thread, optionally pinned to a CPU core
///
/// A negative `core` leaves the thread unpinned; a non-negative `core`
/// pins the thread before `f` runs. Pinning failure on a non-negative
/// core is fatal: a latency-critical thread silently running on the wrong
/// core is a deployment error, not a recoverable condition.
///
/// # Arguments
///
/// * `core` - Logical CPU to pin to, or negative for unpinned
/// * `name` - Thread name (visible in `top -H`, debuggers, panics)
/// * `f` - Thread body
///
/// # Examples
///
/// ```
/// use tickflow::affinity::spawn_pinned;
///
/// let handle = spawn_pinned(-1, "worker", || 2 + 2)?;
/// assert_eq!(handle.join().unwrap(), 4);
/// # Ok::<(), std::io::Error>(())
/// ```
pub fn spawn_pinned<F, T>(core: i32, name: &str, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new().name(name.to_string()).spawn(move || {
        if core >= 0 {
            if let Err(e) = pin_to_cpu(core as usize) {
                panic!("failed to pin thread '{}' to cpu {}: {}", thread_name, core, e);
            }
        }
        f()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_to_cpu() {
        // Pinning to CPU 0 may be denied in restricted environments; just
        // ensure it doesn't panic.
        let _ = pin_to_cpu(0);
    }

    #[test]
    fn test_pin_to_cpu_out_of_range() {
        assert!(pin_to_cpu(4096).is_err());
    }

    #[test]
    fn test_spawn_pinned_unpinned() {
        let handle = spawn_pinned(-1, "test-worker", || 41 + 1).unwrap();
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn test_spawn_pinned_name() {
        let handle = spawn_pinned(-1, "named-thread", || {
            thread::current().name().map(|n| n.to_string())
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("named-thread"));
    }
}
