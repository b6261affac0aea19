//! Core lock-free MPMC ring buffer algorithm.
//!
//! # Algorithm
//!
//! Enqueue and dequeue are each split into a *reserve* and a *commit* phase
//! over four monotonically increasing 64-bit counters:
//!
//! - `write_reserve` / `read_reserve` hand out slots through a CAS loop;
//!   the counter value won by the CAS is the slot's sequence number.
//! - `write_commit` / `read_commit` publish slots strictly in reservation
//!   order: a committer spins until every lower sequence number has
//!   committed, then increments the commit counter by one.
//!
//! With capacity `N` (a power of two), counter value `c` maps to slot
//! `c & (N - 1)`; each slot is written by exactly one producer and read by
//! exactly one consumer per lap around the ring.
//!
//! Because commits happen in reservation order, a consumer that observes
//! `write_commit == k` knows the first `k` reservations are fully written;
//! the release increment on one side pairs with the acquire loads on the
//! other to order payload access.
//!
//! # Safety
//!
//! Slots are handed out as references into a shared array. Exclusivity
//! comes from the protocol: a counter value is won by exactly one CAS, the
//! fullness/emptiness predicates keep the two sides a lap apart, and the
//! commit counters fence payload writes before payload reads.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

use crate::math::next_power_of_two;
use crate::trace::{info, warn};

/// Timeout specification for the blocking reserve helpers.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Spin indefinitely.
    Infinite,
    /// Spin for at most the given duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// One ring element: the queue-stamped sequence number plus the payload.
struct Slot<T> {
    seq: u64,
    value: T,
}

/// Interior-mutable slot cell; access is mediated by the reserve/commit
/// protocol rather than a lock.
struct SlotCell<T>(UnsafeCell<Slot<T>>);

// SAFETY: a slot is only ever touched by the one thread whose reservation
// counter maps to it, between that thread's reserve and commit. The commit
// counters' release/acquire pairing orders writes before the next reader.
unsafe impl<T: Send> Sync for SlotCell<T> {}
unsafe impl<T: Send> Send for SlotCell<T> {}

/// Producer-side counters, on their own cache line.
#[repr(align(64))]
struct WriteCounters {
    /// Next slot to hand out to a writer.
    reserve: AtomicU64,
    /// Number of published writes.
    commit: AtomicU64,
}

/// Consumer-side counters, on their own cache line.
#[repr(align(64))]
struct ReadCounters {
    /// Next slot to hand out to a reader.
    reserve: AtomicU64,
    /// Number of released reads.
    commit: AtomicU64,
}

/// Bounded lock-free multi-producer/multi-consumer ring buffer.
///
/// The ring starts uninitialized (capacity 0, every reserve fails) and is
/// sized exactly once by [`init`](Self::init). Any number of threads may
/// then call the reserve/commit operations concurrently.
///
/// # Example
///
/// ```
/// use kestrel::mpmc::MpmcRing;
///
/// let ring: MpmcRing<Vec<u8>> = MpmcRing::new();
/// assert!(ring.init(13));
/// assert_eq!(ring.capacity(), 16);
///
/// let mut slot = ring.reserve_write().expect("slot available");
/// slot.clear();
/// slot.extend_from_slice(b"payload");
/// slot.commit();
///
/// let slot = ring.reserve_read().expect("one message committed");
/// assert_eq!(&slot[..], b"payload");
/// ```
pub struct MpmcRing<T> {
    write: WriteCounters,
    read: ReadCounters,
    /// Rounded slot count; 0 until `init` succeeds, final afterwards.
    capacity: AtomicU64,
    buffer: UnsafeCell<Box<[SlotCell<T>]>>,
}

// SAFETY: the buffer box itself is written only by the single `init` call
// that wins the capacity CAS, which callers serialize before concurrent
// use; slot contents are protected by the protocol (see `SlotCell`).
unsafe impl<T: Send> Sync for MpmcRing<T> {}
unsafe impl<T: Send> Send for MpmcRing<T> {}

impl<T> MpmcRing<T> {
    /// Creates an uninitialized ring. All reserves fail until
    /// [`init`](Self::init) is called.
    #[must_use]
    pub fn new() -> Self {
        Self {
            write: WriteCounters {
                reserve: AtomicU64::new(0),
                commit: AtomicU64::new(0),
            },
            read: ReadCounters {
                reserve: AtomicU64::new(0),
                commit: AtomicU64::new(0),
            },
            capacity: AtomicU64::new(0),
            buffer: UnsafeCell::new(Box::default()),
        }
    }

    /// Returns the rounded capacity, or 0 if the ring is uninitialized.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Number of committed-but-unread messages.
    ///
    /// The read-side counter is loaded first: `read_commit` can only trail
    /// `write_commit`, so loading it before the write side keeps the
    /// difference non-negative. The result is a lower bound on what a
    /// reader will find by the time it acts.
    #[must_use]
    pub fn len(&self) -> u64 {
        let read = self.read.commit.load(Ordering::Acquire);
        let write = self.write.commit.load(Ordering::Acquire);
        write - read
    }

    /// Whether no committed message is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tries to reserve the next free slot for writing.
    ///
    /// On success the returned guard holds slot `seq & (capacity - 1)`
    /// exclusively; fill the payload through it, then [`commit`] (or drop)
    /// to publish. Returns `None` when the ring looks full to this thread,
    /// or is uninitialized. Never blocks: callers own the retry policy.
    ///
    /// [`commit`]: WriteSlot::commit
    pub fn reserve_write(&self) -> Option<WriteSlot<'_, T>> {
        let capacity = self.capacity.load(Ordering::Acquire);
        let mut write_snapshot = self.write.reserve.load(Ordering::Acquire);
        let read_snapshot = self.read.commit.load(Ordering::Acquire);

        if Self::full(write_snapshot, read_snapshot, capacity) {
            return None;
        }

        loop {
            match self.write.reserve.compare_exchange_weak(
                write_snapshot,
                write_snapshot + 1,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => {
                    write_snapshot = current;
                    // Checked against the entry snapshot of `read_commit`,
                    // not a fresh load: reserve fails fast under pressure
                    // instead of chasing the consumers.
                    if Self::full(write_snapshot, read_snapshot, capacity) {
                        return None;
                    }
                }
            }
        }

        let index = (write_snapshot & (capacity - 1)) as usize;
        // SAFETY: the CAS handed counter value `write_snapshot` to this
        // thread alone, and the fullness check against `read_commit`
        // guarantees the previous lap's reader has released this slot.
        let slot = unsafe { &mut *self.slot(index) };
        slot.seq = write_snapshot;

        Some(WriteSlot {
            ring: self,
            index,
            seq: write_snapshot,
        })
    }

    /// Tries to reserve the oldest committed slot for reading.
    ///
    /// Symmetric to [`reserve_write`](Self::reserve_write), bounded by
    /// `write_commit`. Returns `None` when the ring looks empty to this
    /// thread, or is uninitialized.
    pub fn reserve_read(&self) -> Option<ReadSlot<'_, T>> {
        let capacity = self.capacity.load(Ordering::Acquire);
        let write_snapshot = self.write.commit.load(Ordering::Acquire);
        let mut read_snapshot = self.read.reserve.load(Ordering::Acquire);

        if Self::empty(write_snapshot, read_snapshot) {
            return None;
        }

        loop {
            match self.read.reserve.compare_exchange_weak(
                read_snapshot,
                read_snapshot + 1,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => {
                    read_snapshot = current;
                    // Same fail-fast rule as the write side: the entry
                    // snapshot of `write_commit` is not refreshed.
                    if Self::empty(write_snapshot, read_snapshot) {
                        return None;
                    }
                }
            }
        }

        let index = (read_snapshot & (capacity - 1)) as usize;
        // SAFETY: the CAS handed counter value `read_snapshot` to this
        // thread alone, and the emptiness check against `write_commit`
        // guarantees the producer's payload writes are visible.
        let slot = unsafe { &*self.slot(index) };
        debug_assert_eq!(slot.seq, read_snapshot, "slot stamp out of step");

        Some(ReadSlot {
            ring: self,
            index,
            seq: read_snapshot,
        })
    }

    /// Reserves a write slot, spinning until one frees up or the timeout
    /// elapses.
    pub fn reserve_write_blocking(&self, timeout: Timeout) -> Option<WriteSlot<'_, T>> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(slot) = self.reserve_write() {
                return Some(slot);
            }
            if let Some(deadline) = deadline
                && Instant::now() > deadline
            {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    /// Reserves a read slot, spinning until a message arrives or the
    /// timeout elapses.
    pub fn reserve_read_blocking(&self, timeout: Timeout) -> Option<ReadSlot<'_, T>> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(slot) = self.reserve_read() {
                return Some(slot);
            }
            if let Some(deadline) = deadline
                && Instant::now() > deadline
            {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    fn commit_write(&self, seq: u64) {
        // Commits land in reservation order: wait for the predecessor.
        while self.write.commit.load(Ordering::Acquire) < seq {
            std::hint::spin_loop();
        }
        self.write.commit.fetch_add(1, Ordering::Release);
    }

    fn commit_read(&self, seq: u64) {
        while self.read.commit.load(Ordering::Acquire) < seq {
            std::hint::spin_loop();
        }
        self.read.commit.fetch_add(1, Ordering::Release);
    }

    fn slot(&self, index: usize) -> *mut Slot<T> {
        // SAFETY: `init` filled the buffer before any reservation could
        // succeed (capacity stays 0 until then, so every reserve fails).
        let buffer = unsafe { &*self.buffer.get() };
        buffer[index].0.get()
    }

    /// The snapshots may come from different instants, so the gap can
    /// legitimately exceed the capacity: `>=`, not `==`.
    fn full(write_ctr: u64, read_ctr: u64, capacity: u64) -> bool {
        write_ctr.wrapping_sub(read_ctr) >= capacity
    }

    /// Same snapshot caveat as [`full`](Self::full).
    fn empty(write_ctr: u64, read_ctr: u64) -> bool {
        read_ctr >= write_ctr
    }
}

impl<T: Default> MpmcRing<T> {
    /// Sizes the ring to the smallest power of two ≥ `max(suggested, 1)`.
    ///
    /// Every slot payload is default-constructed once, here; afterwards
    /// payloads are only mutated in place. Must be called exactly once,
    /// serialized before any other use of the ring. Returns `false` if the
    /// ring is already initialized; the capacity is final after a
    /// successful return, and all four counters read 0.
    pub fn init(&self, suggested_capacity: u64) -> bool {
        let capacity = next_power_of_two(suggested_capacity.max(1));

        if self
            .capacity
            .compare_exchange(0, capacity, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                capacity = self.capacity.load(Ordering::Acquire),
                "ring already initialized"
            );
            return false;
        }

        let slots = (0..capacity)
            .map(|_| {
                SlotCell(UnsafeCell::new(Slot {
                    seq: 0,
                    value: T::default(),
                }))
            })
            .collect();
        // SAFETY: this call won the capacity CAS, so it is the only writer
        // of the buffer; the caller serializes `init` before reserves.
        unsafe { *self.buffer.get() = slots };

        info!(capacity, "ring initialized");
        true
    }
}

impl<T> Default for MpmcRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle to a reserved write slot.
///
/// Dereferences to the payload, which still holds whatever the previous
/// lap left behind — the writer overwrites (or clears) it. Dropping the
/// guard publishes the slot, so every reservation commits exactly once
/// even on early return or panic; [`commit`](Self::commit) just names the
/// publication point.
pub struct WriteSlot<'a, T> {
    ring: &'a MpmcRing<T>,
    index: usize,
    seq: u64,
}

impl<T> WriteSlot<'_, T> {
    /// The sequence number stamped at reservation.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Publishes the slot to readers.
    ///
    /// Publication is ordered by sequence number: this spins until every
    /// earlier reservation has committed, then increments `write_commit`.
    pub fn commit(self) {}
}

impl<T> Deref for WriteSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard owns the slot until it commits (drops).
        unsafe { &(*self.ring.slot(self.index)).value }
    }
}

impl<T> DerefMut for WriteSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; `&mut self` forbids aliased payload access.
        unsafe { &mut (*self.ring.slot(self.index)).value }
    }
}

impl<T> Drop for WriteSlot<'_, T> {
    fn drop(&mut self) {
        self.ring.commit_write(self.seq);
    }
}

/// Shared handle to a reserved read slot.
///
/// Dereferences to the payload written by the producer of this sequence
/// number. Dropping the guard releases the slot back to writers;
/// [`commit`](Self::commit) names the release point.
pub struct ReadSlot<'a, T> {
    ring: &'a MpmcRing<T>,
    index: usize,
    seq: u64,
}

impl<T> ReadSlot<'_, T> {
    /// The sequence number stamped at the producer's reservation.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Releases the slot back to writers, in sequence order.
    pub fn commit(self) {}
}

impl<T> Deref for ReadSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the slot until it commits (drops), and
        // the producer's writes were published before `write_commit`
        // covered this sequence number.
        unsafe { &(*self.ring.slot(self.index)).value }
    }
}

impl<T> Drop for ReadSlot<'_, T> {
    fn drop(&mut self) {
        self.ring.commit_read(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let ring: MpmcRing<u64> = MpmcRing::new();
        assert_eq!(ring.capacity(), 0);
        assert!(ring.init(13));
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn second_init_is_rejected() {
        let ring: MpmcRing<u64> = MpmcRing::new();
        assert!(ring.init(8));
        assert!(!ring.init(8));
        assert!(!ring.init(1024));
        assert_eq!(ring.capacity(), 8);
    }

    #[test]
    fn zero_capacity_rounds_to_one() {
        let ring: MpmcRing<u64> = MpmcRing::new();
        assert!(ring.init(0));
        assert_eq!(ring.capacity(), 1);
    }

    #[test]
    fn uninitialized_ring_rejects_all_reserves() {
        let ring: MpmcRing<u64> = MpmcRing::new();
        assert!(ring.reserve_write().is_none());
        assert!(ring.reserve_read().is_none());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn fill_and_drain() {
        let ring: MpmcRing<u64> = MpmcRing::new();
        assert!(ring.init(13));
        let capacity = ring.capacity();

        // Reserve every slot; sequence numbers are handed out in order.
        let mut writes = Vec::new();
        for expected_seq in 0..capacity {
            let mut slot = ring.reserve_write().expect("slot available");
            assert_eq!(slot.seq(), expected_seq);
            *slot = expected_seq * 3;
            writes.push(slot);
        }
        assert!(ring.reserve_write().is_none(), "ring is fully reserved");
        // Reserved-but-uncommitted slots are invisible to readers.
        assert_eq!(ring.len(), 0);
        assert!(ring.reserve_read().is_none());

        for (committed, slot) in writes.drain(..).enumerate() {
            slot.commit();
            assert_eq!(ring.len(), committed as u64 + 1);
        }

        let mut reads = Vec::new();
        for expected_seq in 0..capacity {
            let slot = ring.reserve_read().expect("message available");
            assert_eq!(slot.seq(), expected_seq);
            assert_eq!(*slot, expected_seq * 3);
            reads.push(slot);
        }
        assert!(ring.reserve_read().is_none(), "every message is reserved");
        assert_eq!(ring.len(), capacity);

        for (released, slot) in reads.drain(..).enumerate() {
            slot.commit();
            assert_eq!(ring.len(), capacity - released as u64 - 1);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn sequence_numbers_grow_across_laps() {
        let ring: MpmcRing<u64> = MpmcRing::new();
        assert!(ring.init(4));

        for i in 0..20 {
            let mut slot = ring.reserve_write().expect("slot available");
            assert_eq!(slot.seq(), i);
            *slot = i + 1000;
            slot.commit();

            let slot = ring.reserve_read().expect("message available");
            assert_eq!(slot.seq(), i);
            assert_eq!(*slot, i + 1000);
            slot.commit();
        }
    }

    #[test]
    fn payload_is_reused_in_place() {
        let ring: MpmcRing<Vec<u8>> = MpmcRing::new();
        assert!(ring.init(1));

        let mut slot = ring.reserve_write().expect("slot available");
        slot.extend_from_slice(b"first");
        slot.commit();
        ring.reserve_read().expect("message available").commit();

        // The next lap sees the previous payload; the writer owns clearing.
        let mut slot = ring.reserve_write().expect("slot available");
        assert_eq!(&slot[..], b"first");
        slot.clear();
        slot.extend_from_slice(b"second");
        slot.commit();

        let slot = ring.reserve_read().expect("message available");
        assert_eq!(&slot[..], b"second");
    }

    #[test]
    fn drop_commits_the_reservation() {
        let ring: MpmcRing<u64> = MpmcRing::new();
        assert!(ring.init(2));

        {
            let mut slot = ring.reserve_write().expect("slot available");
            *slot = 7;
            // No explicit commit: dropping the guard publishes.
        }
        assert_eq!(ring.len(), 1);
        assert_eq!(*ring.reserve_read().expect("message available"), 7);
    }

    #[test]
    fn blocking_reserve_times_out_when_full() {
        let ring: MpmcRing<u64> = MpmcRing::new();
        assert!(ring.init(1));

        ring.reserve_write().expect("slot available").commit();
        let timeout = Timeout::from(Duration::from_millis(10));
        assert!(ring.reserve_write_blocking(timeout).is_none());

        ring.reserve_read().expect("message available").commit();
        assert!(ring.reserve_write_blocking(Timeout::Infinite).is_some());
    }

    #[test]
    fn blocking_read_times_out_when_empty() {
        let ring: MpmcRing<u64> = MpmcRing::new();
        assert!(ring.init(4));

        let timeout = Timeout::from(Duration::from_millis(10));
        assert!(ring.reserve_read_blocking(timeout).is_none());

        ring.reserve_write().expect("slot available").commit();
        assert!(ring.reserve_read_blocking(timeout).is_some());
    }
}
