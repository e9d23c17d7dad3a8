//! Fixed-capacity object pool with constant-time allocate/deallocate
//!
//! The pool pre-allocates every slot at construction and never grows, so
//! there is no heap traffic after startup and a slot keeps the same index
//! for the pool's whole lifetime. Allocation hands out a [`PoolHandle`]
//! (slot index plus a generation counter) rather than a raw pointer; the
//! generation lets the pool catch double-frees and stale handles that a
//! pointer-based design would silently corrupt on.
//!
//! Exhaustion, double-free and foreign handles are programmer errors and
//! terminate the process; callers size their pools so these never happen
//! at steady state.
//!
//! The pool is deliberately not thread-safe: each pool is owned by exactly
//! one thread.

/// Opaque handle to a pool slot: stable index plus allocation generation.
///
/// Handles are cheap to copy and compare; a handle is valid from the
/// `allocate` that produced it until the matching `deallocate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolHandle {
    index: u32,
    generation: u32,
}

impl PoolHandle {
    /// Slot index inside the pool. Stable for the pool lifetime.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct Slot<T> {
    value: T,
    free: bool,
    generation: u32,
}

/// Fixed-capacity object pool.
///
/// # Examples
///
/// ```
/// use tickflow::pool::MemoryPool;
///
/// let mut pool = MemoryPool::<f64>::new(4);
/// let h = pool.allocate(1.5);
/// assert_eq!(*pool.get(h), 1.5);
/// pool.deallocate(h);
/// assert_eq!(pool.free_slots(), 4);
/// ```
pub struct MemoryPool<T> {
    store: Vec<Slot<T>>,
    next_free_index: usize,
    in_use: usize,
}

impl<T: Default> MemoryPool<T> {
    /// Creates a pool with `capacity` pre-initialized free slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "memory pool capacity must be non-zero");
        let store = (0..capacity)
            .map(|_| Slot {
                value: T::default(),
                free: true,
                generation: 0,
            })
            .collect();
        Self {
            store,
            next_free_index: 0,
            in_use: 0,
        }
    }

    /// Places `value` into a free slot and returns its handle.
    ///
    /// Amortized O(1): the free-slot cursor advances past in-use slots,
    /// wrapping around the store.
    ///
    /// # Panics
    ///
    /// Panics when no free slot exists ("memory pool out of space").
    /// Exhaustion is a sizing error, not a recoverable condition.
    pub fn allocate(&mut self, value: T) -> PoolHandle {
        self.seek_free_slot();
        let index = self.next_free_index;
        let slot = &mut self.store[index];
        slot.value = value;
        slot.free = false;
        self.in_use += 1;
        let handle = PoolHandle {
            index: index as u32,
            generation: slot.generation,
        };
        // Start the next search just past the slot we handed out.
        self.next_free_index = (index + 1) % self.store.len();
        handle
    }

    /// Returns `handle`'s slot to the pool.
    ///
    /// # Panics
    ///
    /// Panics on a handle that is out of range, already free (double
    /// free), or from an earlier occupancy of the slot (stale handle).
    pub fn deallocate(&mut self, handle: PoolHandle) {
        let index = handle.index as usize;
        assert!(
            index < self.store.len(),
            "handle index {} does not belong to this pool",
            index
        );
        let slot = &mut self.store[index];
        assert!(!slot.free, "double free of pool slot {}", index);
        assert_eq!(
            slot.generation, handle.generation,
            "stale handle for pool slot {}",
            index
        );
        slot.free = true;
        slot.generation = slot.generation.wrapping_add(1);
        slot.value = T::default();
        self.in_use -= 1;
    }

    /// Shared access to the value behind `handle`.
    ///
    /// # Panics
    ///
    /// Panics on an invalid handle (see [`deallocate`](Self::deallocate)).
    pub fn get(&self, handle: PoolHandle) -> &T {
        let slot = self.checked_slot(handle);
        &self.store[slot].value
    }

    /// Exclusive access to the value behind `handle`.
    ///
    /// # Panics
    ///
    /// Panics on an invalid handle (see [`deallocate`](Self::deallocate)).
    pub fn get_mut(&mut self, handle: PoolHandle) -> &mut T {
        let slot = self.checked_slot(handle);
        &mut self.store[slot].value
    }

    /// Total slot count.
    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// Number of slots currently free.
    pub fn free_slots(&self) -> usize {
        self.store.len() - self.in_use
    }

    fn checked_slot(&self, handle: PoolHandle) -> usize {
        let index = handle.index as usize;
        assert!(
            index < self.store.len(),
            "handle index {} does not belong to this pool",
            index
        );
        let slot = &self.store[index];
        assert!(!slot.free, "handle refers to a free pool slot {}", index);
        assert_eq!(
            slot.generation, handle.generation,
            "stale handle for pool slot {}",
            index
        );
        index
    }

    /// Advances the cursor to a free slot, wrapping once around the store.
    fn seek_free_slot(&mut self) {
        let start = self.next_free_index;
        while !self.store[self.next_free_index].free {
            self.next_free_index = (self.next_free_index + 1) % self.store.len();
            assert!(
                self.next_free_index != start,
                "memory pool out of space (capacity {})",
                self.store.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_read_back() {
        let mut pool = MemoryPool::<u64>::new(8);
        let a = pool.allocate(11);
        let b = pool.allocate(22);
        assert_ne!(a.index(), b.index());
        assert_eq!(*pool.get(a), 11);
        assert_eq!(*pool.get(b), 22);
        assert_eq!(pool.free_slots(), 6);
    }

    #[test]
    fn test_every_fifth_freed_leaves_ten_free() {
        let mut pool = MemoryPool::<f64>::new(50);
        for i in 0..50 {
            let h = pool.allocate(i as f64);
            assert_eq!(*pool.get(h), i as f64);
            if i % 5 == 0 {
                pool.deallocate(h);
            }
        }
        assert_eq!(pool.free_slots(), 10);
    }

    #[test]
    fn test_allocate_deallocate_is_steady_state() {
        let mut pool = MemoryPool::<u32>::new(4);
        for i in 0..100 {
            let h = pool.allocate(i);
            assert_eq!(*pool.get(h), i);
            pool.deallocate(h);
            assert_eq!(pool.free_slots(), 4);
        }
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut pool = MemoryPool::<u32>::new(3);
        let handles: Vec<_> = (0..3).map(|i| pool.allocate(i)).collect();
        assert_eq!(pool.free_slots(), 0);

        // Free slot k in the middle of a full pool; the next allocation
        // must land exactly there.
        let k = handles[1];
        pool.deallocate(k);
        let h = pool.allocate(99);
        assert_eq!(h.index(), k.index());
        assert_eq!(*pool.get(h), 99);
    }

    #[test]
    fn test_handles_survive_neighbor_churn() {
        let mut pool = MemoryPool::<u64>::new(4);
        let keeper = pool.allocate(7777);
        for i in 0..20 {
            let h = pool.allocate(i);
            pool.deallocate(h);
        }
        assert_eq!(*pool.get(keeper), 7777);
    }

    #[test]
    #[should_panic(expected = "memory pool out of space")]
    fn test_exhaustion_is_fatal() {
        let mut pool = MemoryPool::<u8>::new(2);
        pool.allocate(1);
        pool.allocate(2);
        pool.allocate(3);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal() {
        let mut pool = MemoryPool::<u8>::new(2);
        let h = pool.allocate(1);
        pool.deallocate(h);
        pool.deallocate(h);
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_stale_handle_is_fatal() {
        let mut pool = MemoryPool::<u8>::new(1);
        let old = pool.allocate(1);
        pool.deallocate(old);
        let _new = pool.allocate(2);
        // Same slot, older generation.
        pool.get(old);
    }

    #[test]
    #[should_panic(expected = "does not belong to this pool")]
    fn test_foreign_handle_is_fatal() {
        let mut big = MemoryPool::<u8>::new(16);
        let mut small = MemoryPool::<u8>::new(2);
        let mut h = big.allocate(1);
        for _ in 0..9 {
            h = big.allocate(1);
        }
        // Index 9 is out of range for the 2-slot pool.
        small.deallocate(h);
    }
}
