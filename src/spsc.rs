//! Bounded lock-free single-producer / single-consumer ring
//!
//! The ring passes fixed-size records from exactly one producer thread to
//! exactly one consumer thread with no locks and no allocation after
//! construction. The hot path is a pair of plain slot accesses bracketed
//! by release/acquire operations on the shared element counter.
//!
//! # Protocol
//!
//! The producer borrows the slot under its write cursor with
//! [`Producer::next_write_slot`], fills it in place, then publishes it with
//! [`Producer::commit_write`]. The consumer observes published slots with
//! [`Consumer::next_read_slot`] and retires them with
//! [`Consumer::commit_read`]. Each cursor is a plain field of its handle
//! (only one thread ever touches it), so the only shared state is the
//! element counter:
//!
//! ```text
//! producer fills slot, then Release-increments size
//!     → consumer Acquire-loads size, then reads slot
//! consumer reads slot, then Release-decrements size
//!     → producer Acquire-loads size, then may refill slot
//! ```
//!
//! # Overrun
//!
//! Writing into a full ring is a caller precondition violation, not a
//! condition the ring reports: callers size the ring so that overrun
//! cannot occur at steady state (the logger uses 8 Mi slots). The
//! producer's acquire load of the counter happens in every build (it is
//! the reuse edge above, not a sanity check); only the overrun assert
//! itself is debug-only.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Shared storage behind a producer/consumer handle pair.
struct Ring<T> {
    /// Slot storage. Producer and consumer touch disjoint slots; the size
    /// counter is what keeps them disjoint.
    slots: Box<[UnsafeCell<T>]>,
    /// Number of published, unconsumed elements. Padded onto its own cache
    /// line so the contended counter never false-shares with the slot
    /// metadata.
    size: CachePadded<AtomicUsize>,
}

// SAFETY: the SPSC protocol guarantees the producer and consumer access
// disjoint slots; the size counter's release/acquire pairing orders slot
// writes before slot reads.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

/// Producer endpoint of an SPSC ring. Owned by exactly one thread.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
    write_index: usize,
}

/// Consumer endpoint of an SPSC ring. Owned by exactly one thread.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
    read_index: usize,
}

// SAFETY: each handle may move to another thread, but `&mut self` on every
// mutating method keeps use single-threaded per endpoint.
unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}

/// Creates a bounded SPSC ring with `capacity` slots.
///
/// Capacity is a runtime parameter and need not be a power of two. Slots
/// are default-initialized up front; `T` must be a plain copyable record
/// (no destructor to run when a slot is overwritten).
///
/// # Panics
///
/// Panics if `capacity` is zero.
///
/// # Examples
///
/// ```
/// use tickflow::spsc::spsc_ring;
///
/// let (mut tx, mut rx) = spsc_ring::<u64>(8);
/// *tx.next_write_slot() = 7;
/// tx.commit_write();
/// assert_eq!(rx.next_read_slot().copied(), Some(7));
/// rx.commit_read();
/// assert_eq!(rx.next_read_slot(), None);
/// ```
pub fn spsc_ring<T: Copy + Default>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "spsc ring capacity must be non-zero");
    let slots: Box<[UnsafeCell<T>]> = (0..capacity)
        .map(|_| UnsafeCell::new(T::default()))
        .collect();
    let ring = Arc::new(Ring {
        slots,
        size: CachePadded::new(AtomicUsize::new(0)),
    });
    (
        Producer {
            ring: Arc::clone(&ring),
            write_index: 0,
        },
        Consumer {
            ring,
            read_index: 0,
        },
    )
}

impl<T: Copy + Default> Producer<T> {
    /// Borrows the slot under the write cursor for in-place filling.
    ///
    /// The reference stays valid until [`commit_write`](Self::commit_write);
    /// calling this again before committing returns the same slot.
    #[inline(always)]
    pub fn next_write_slot(&mut self) -> &mut T {
        // Acquire pairs with the consumer's Release decrement in
        // commit_read: observing size < capacity here orders every read of
        // this slot's previous occupant before the write about to happen,
        // so wrapping reuse of the slot cannot race the consumer.
        let _size = self.ring.size.load(Ordering::Acquire);
        debug_assert!(
            _size < self.ring.slots.len(),
            "spsc ring overrun: producer outran consumer"
        );
        // SAFETY: this slot is outside the published [read, read+size)
        // window, so the consumer will not touch it until commit_write.
        unsafe { &mut *self.ring.slots[self.write_index].get() }
    }

    /// Publishes the slot filled via [`next_write_slot`](Self::next_write_slot)
    /// and advances the write cursor.
    #[inline(always)]
    pub fn commit_write(&mut self) {
        self.write_index = (self.write_index + 1) % self.ring.slots.len();
        // Release pairs with the consumer's Acquire load in next_read_slot,
        // ordering the slot write before the consumer's read.
        self.ring.size.fetch_add(1, Ordering::Release);
    }

    /// Number of published, unconsumed elements. Approximate under
    /// concurrency but always within `[0, capacity]`.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.ring.size.load(Ordering::Acquire)
    }

    /// Total slot count.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }
}

impl<T: Copy + Default> Consumer<T> {
    /// Returns the oldest published slot, or `None` when the ring is empty.
    #[inline(always)]
    pub fn next_read_slot(&self) -> Option<&T> {
        if self.ring.size.load(Ordering::Acquire) == 0 {
            return None;
        }
        // SAFETY: size > 0 means the producer published this slot with a
        // Release increment we just acquired; the producer will not rewrite
        // it until commit_read retires it.
        Some(unsafe { &*self.ring.slots[self.read_index].get() })
    }

    /// Retires the slot returned by [`next_read_slot`](Self::next_read_slot)
    /// and advances the read cursor.
    #[inline(always)]
    pub fn commit_read(&mut self) {
        debug_assert!(
            self.ring.size.load(Ordering::Relaxed) > 0,
            "commit_read on an empty spsc ring"
        );
        self.read_index = (self.read_index + 1) % self.ring.slots.len();
        // Release pairs with the producer's next overrun check / slot reuse.
        self.ring.size.fetch_sub(1, Ordering::Release);
    }

    /// Number of published, unconsumed elements. Approximate under
    /// concurrency but always within `[0, capacity]`.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.ring.size.load(Ordering::Acquire)
    }

    /// Total slot count.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_empty_ring_reads_none() {
        let (_tx, rx) = spsc_ring::<u32>(4);
        assert_eq!(rx.next_read_slot(), None);
        assert_eq!(rx.size(), 0);
    }

    #[test]
    fn test_size_one_identity() {
        let (mut tx, mut rx) = spsc_ring::<f64>(1);
        for round in 0..5 {
            *tx.next_write_slot() = round as f64 + 0.5;
            tx.commit_write();
            assert_eq!(rx.next_read_slot().copied(), Some(round as f64 + 0.5));
            rx.commit_read();
            assert_eq!(rx.next_read_slot(), None);
        }
    }

    #[test]
    fn test_fill_to_capacity_and_drain() {
        let (mut tx, mut rx) = spsc_ring::<u32>(8);
        for i in 0..7u32 {
            *tx.next_write_slot() = i;
            tx.commit_write();
        }
        assert_eq!(tx.size(), 7);
        *tx.next_write_slot() = 7;
        tx.commit_write();
        assert_eq!(tx.size(), 8);

        for i in 0..8u32 {
            assert_eq!(rx.next_read_slot().copied(), Some(i));
            rx.commit_read();
        }
        assert_eq!(rx.next_read_slot(), None);
        assert_eq!(rx.size(), 0);
    }

    #[test]
    fn test_wraparound_fifo() {
        // Non-power-of-two capacity, repeatedly wrapped.
        let (mut tx, mut rx) = spsc_ring::<u64>(5);
        let mut next_expected = 0u64;
        for round in 0..20u64 {
            for i in 0..3 {
                *tx.next_write_slot() = round * 3 + i;
                tx.commit_write();
            }
            for _ in 0..3 {
                assert_eq!(rx.next_read_slot().copied(), Some(next_expected));
                rx.commit_read();
                next_expected += 1;
            }
        }
        assert_eq!(rx.next_read_slot(), None);
    }

    #[test]
    fn test_cross_thread_fifo() {
        let (mut tx, mut rx) = spsc_ring::<u64>(64);
        const COUNT: u64 = 10_000;

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                while tx.size() == tx.capacity() {
                    std::hint::spin_loop();
                }
                *tx.next_write_slot() = i;
                tx.commit_write();
            }
        });

        let consumer = thread::spawn(move || {
            let mut received = Vec::with_capacity(COUNT as usize);
            while received.len() < COUNT as usize {
                match rx.next_read_slot() {
                    Some(&v) => {
                        received.push(v);
                        rx.commit_read();
                    }
                    None => std::hint::spin_loop(),
                }
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        for (i, &v) in received.iter().enumerate() {
            assert_eq!(v, i as u64, "FIFO violation at index {}", i);
        }
    }

    #[test]
    fn test_slow_consumer_triples_in_order() {
        // Producer enqueues 50 triples with a small spacing while the
        // consumer starts late and drains at the same cadence; the backlog
        // stays well inside the 20-slot ring.
        #[derive(Clone, Copy, Default, PartialEq, Debug)]
        struct Triple {
            d: [i32; 3],
        }

        let (mut tx, mut rx) = spsc_ring::<Triple>(20);

        let producer = thread::spawn(move || {
            for i in 0..50 {
                *tx.next_write_slot() = Triple {
                    d: [i, i * 10, i * 100],
                };
                tx.commit_write();
                thread::sleep(Duration::from_millis(1));
            }
        });

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            let mut seen = Vec::new();
            while seen.len() < 50 {
                if let Some(&t) = rx.next_read_slot() {
                    seen.push(t);
                    rx.commit_read();
                    thread::sleep(Duration::from_millis(1));
                }
            }
            seen
        });

        producer.join().unwrap();
        let seen = consumer.join().unwrap();
        assert_eq!(seen.len(), 50);
        for (i, t) in seen.iter().enumerate() {
            let i = i as i32;
            assert_eq!(t.d, [i, i * 10, i * 100]);
        }
    }
}
