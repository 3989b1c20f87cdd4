//! bounded_mpmc - Fixed-capacity lock-free MPMC ring queue with timed waits
//!
//! Producers and consumers race for slots with a compare-and-swap on two
//! monotonic cursors. When the buffer is full (or empty) a call spins and
//! yields until room (or a value) appears or its timeout runs out, and then
//! reports the timeout as a plain value instead of blocking forever.
#![warn(missing_docs)]

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::time::Duration;
use std::time::Instant;

use crossbeam_utils::CachePadded;

mod config;
pub mod driver;
mod error;
mod sync;
mod trace;

pub use config::{Config, DEFAULT_TIMEOUT};
pub use error::{CapacityError, Empty, Full, PopTimeout, PushTimeout};
pub use trace::init_tracing;

use sync::{AtomicUsize, Ordering};
use trace::trace;

/// One cell of the ring.
///
/// `stamp` is the occupancy marker tagged with the ticket it belongs to:
/// [`vacant`] for the ticket allowed to write the cell next, [`occupied`] once
/// that ticket's value is published. Consuming ticket `t` stores
/// `vacant(t + CAP)`, handing the cell to the next lap.
#[repr(C, align(64))]
struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new(stamp: usize) -> Self {
        Slot {
            stamp: AtomicUsize::new(stamp),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Stamp of a cell that ticket `t` may fill.
#[inline(always)]
const fn vacant(t: usize) -> usize {
    t.wrapping_mul(2)
}

/// Stamp of a cell holding the value pushed with ticket `t`.
#[inline(always)]
const fn occupied(t: usize) -> usize {
    t.wrapping_mul(2).wrapping_add(1)
}

/// Whether `stamp` belongs to an earlier lap than `expected`.
#[inline(always)]
const fn behind(stamp: usize, expected: usize) -> bool {
    (stamp.wrapping_sub(expected) as isize) < 0
}

/// Absolute end of a blocking call. `None` when the budget overflows `Instant`.
#[derive(Clone, Copy)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Deadline(Instant::now().checked_add(timeout))
    }

    fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

/// Bounded lock-free MPMC queue with `CAP` slots.
///
/// `CAP` must be a non-zero power of two. Any number of threads may call
/// [`push`](Queue::push) and [`pop`](Queue::pop) through a shared reference.
pub struct Queue<T, const CAP: usize> {
    buffer: Box<[Slot<T>]>,
    insert: CachePadded<AtomicUsize>,
    remove: CachePadded<AtomicUsize>,
    config: Config,
}

impl<T, const CAP: usize> Queue<T, CAP> {
    const MASK: usize = CAP.wrapping_sub(1);

    /// Create a queue with the default wait policy.
    ///
    /// # Panics
    ///
    /// Panics if `CAP` is zero or not a power of two.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a queue with a custom wait policy.
    ///
    /// # Panics
    ///
    /// Panics if `CAP` is zero or not a power of two.
    pub fn with_config(config: Config) -> Self {
        match Self::try_with_config(config) {
            Ok(queue) => queue,
            Err(err) => panic!("{err}"),
        }
    }

    /// Fallible [`new`](Queue::new).
    pub fn try_new() -> Result<Self, CapacityError> {
        Self::try_with_config(Config::default())
    }

    /// Fallible [`with_config`](Queue::with_config).
    pub fn try_with_config(config: Config) -> Result<Self, CapacityError> {
        if CAP == 0 {
            return Err(CapacityError::Zero);
        }
        if !CAP.is_power_of_two() {
            return Err(CapacityError::NotPowerOfTwo(CAP));
        }

        let buffer = (0..CAP).map(|i| Slot::new(vacant(i))).collect();
        Ok(Queue {
            buffer,
            insert: CachePadded::new(AtomicUsize::new(0)),
            remove: CachePadded::new(AtomicUsize::new(0)),
            config,
        })
    }

    /// Push `value`, waiting up to the configured timeout for a free slot.
    ///
    /// On timeout nothing is modified and the value comes back inside the
    /// error.
    pub fn push(&self, value: T) -> Result<(), PushTimeout<T>> {
        self.push_until(value, Deadline::after(self.config.timeout))
    }

    /// [`push`](Queue::push) with a budget for this call only.
    pub fn push_timeout(&self, value: T, timeout: Duration) -> Result<(), PushTimeout<T>> {
        self.push_until(value, Deadline::after(timeout))
    }

    /// Pop the oldest value, waiting up to the configured timeout for one.
    pub fn pop(&self) -> Result<T, PopTimeout> {
        self.pop_until(Deadline::after(self.config.timeout))
    }

    /// [`pop`](Queue::pop) with a budget for this call only.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, PopTimeout> {
        self.pop_until(Deadline::after(timeout))
    }

    /// Non-blocking push. Fails if the slot at the insert cursor still
    /// belongs to the previous lap, including a write that is reserved but
    /// not yet published.
    pub fn try_push(&self, value: T) -> Result<(), Full<T>> {
        loop {
            match self.reserve_insert() {
                Reserve::Won(ticket) => {
                    // SAFETY: winning the CAS on `insert` grants exclusive
                    // write access to this slot until its stamp moves on.
                    unsafe { self.publish(ticket, value) };
                    return Ok(());
                }
                Reserve::Lost => core::hint::spin_loop(),
                Reserve::Blocked => return Err(Full(value)),
            }
        }
    }

    /// Non-blocking pop. Fails if the slot at the remove cursor has not been
    /// published yet or is still being read by the previous lap.
    pub fn try_pop(&self) -> Result<T, Empty> {
        loop {
            match self.reserve_remove() {
                // SAFETY: see `pop_until`.
                Reserve::Won(ticket) => return Ok(unsafe { self.take(ticket) }),
                Reserve::Lost => core::hint::spin_loop(),
                Reserve::Blocked => return Err(Empty),
            }
        }
    }

    fn push_until(&self, value: T, deadline: Deadline) -> Result<(), PushTimeout<T>> {
        let mut spin = 0;
        loop {
            match self.reserve_insert() {
                Reserve::Won(ticket) => {
                    // SAFETY: winning the CAS on `insert` grants exclusive
                    // write access to this slot until its stamp moves on.
                    unsafe { self.publish(ticket, value) };
                    return Ok(());
                }
                Reserve::Lost => core::hint::spin_loop(),
                Reserve::Blocked => spin = self.config.backoff(spin),
            }
            if deadline.expired() {
                trace!(capacity = CAP, len = self.len(), "push timed out");
                return Err(PushTimeout(value));
            }
        }
    }

    fn pop_until(&self, deadline: Deadline) -> Result<T, PopTimeout> {
        let mut spin = 0;
        loop {
            match self.reserve_remove() {
                // SAFETY: winning the CAS on `remove` for a published slot
                // grants exclusive read access until the stamp is cleared.
                Reserve::Won(ticket) => return Ok(unsafe { self.take(ticket) }),
                Reserve::Lost => core::hint::spin_loop(),
                Reserve::Blocked => spin = self.config.backoff(spin),
            }
            if deadline.expired() {
                trace!(capacity = CAP, len = self.len(), "pop timed out");
                return Err(PopTimeout);
            }
        }
    }

    /// Snapshot the insert cursor and its slot, then race for the slot.
    fn reserve_insert(&self) -> Reserve {
        let mut tail = self.insert.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[tail & Self::MASK];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == vacant(tail) {
                // Empty for this lap. Only the CAS winner may fill it.
                return match self.insert.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => Reserve::Won(tail),
                    Err(_) => Reserve::Lost,
                };
            }
            if behind(stamp, vacant(tail)) {
                // The previous lap still owns this slot, published or not:
                // full at this slot.
                return Reserve::Blocked;
            }
            // Another producer moved the cursor past our snapshot.
            tail = self.insert.load(Ordering::Relaxed);
        }
    }

    fn reserve_remove(&self) -> Reserve {
        let mut head = self.remove.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[head & Self::MASK];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == occupied(head) {
                return match self.remove.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => Reserve::Won(head),
                    Err(_) => Reserve::Lost,
                };
            }
            if behind(stamp, occupied(head)) {
                // Not published for this lap yet, or the previous lap's
                // consumer has not released the slot.
                return Reserve::Blocked;
            }
            head = self.remove.load(Ordering::Relaxed);
        }
    }

    /// # Safety
    ///
    /// The caller must have won the insert CAS for `ticket`.
    unsafe fn publish(&self, ticket: usize, value: T) {
        let slot = &self.buffer[ticket & Self::MASK];
        unsafe { (*slot.value.get()).write(value) };
        slot.stamp.store(occupied(ticket), Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller must have won the remove CAS for `ticket`, which it only
    /// attempts after observing the published stamp with `Acquire`.
    unsafe fn take(&self, ticket: usize) -> T {
        let slot = &self.buffer[ticket & Self::MASK];
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.stamp.store(vacant(ticket.wrapping_add(CAP)), Ordering::Release);
        value
    }

    /// Number of slots. Constant for the lifetime of the queue.
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Best-effort element count, always within `0..=CAP`.
    ///
    /// Under concurrent mutation this is a snapshot, not a consistent value.
    pub fn len(&self) -> usize {
        // Remove first: the insert cursor read afterwards can only be ahead.
        let remove = self.remove.load(Ordering::SeqCst);
        let insert = self.insert.load(Ordering::SeqCst);

        // Consumers may have moved on between the two loads.
        if insert.wrapping_sub(remove) >= CAP {
            return CAP;
        }
        // Cursors meet on the ring both when empty and when full; the
        // check above already took the full case.
        CAP.wrapping_sub(remove & Self::MASK)
            .wrapping_add(insert & Self::MASK)
            & Self::MASK
    }

    /// `len() == 0`, as a snapshot.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `len() == capacity()`, as a snapshot.
    pub fn is_full(&self) -> bool {
        self.len() == CAP
    }

    /// Wait policy of this queue.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Outcome of one snapshot-then-race round.
enum Reserve {
    Won(usize),
    Lost,
    Blocked,
}

impl<T, const CAP: usize> Default for Queue<T, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const CAP: usize> fmt::Debug for Queue<T, CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &CAP)
            .field("len", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

unsafe impl<T: Send, const CAP: usize> Send for Queue<T, CAP> {}
unsafe impl<T: Send, const CAP: usize> Sync for Queue<T, CAP> {}

impl<T, const CAP: usize> Drop for Queue<T, CAP> {
    fn drop(&mut self) {
        let insert = self.insert.load(Ordering::Relaxed);
        let mut pos = self.remove.load(Ordering::Relaxed);
        while pos != insert {
            let slot = &self.buffer[pos & Self::MASK];
            if slot.stamp.load(Ordering::Relaxed) == occupied(pos) {
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
            pos = pos.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke() {
        let q = Queue::<i32, 8>::new();
        q.push(42).unwrap();
        assert_eq!(q.pop().unwrap(), 42);
    }

    #[test]
    fn try_push_try_pop() {
        let q = Queue::<i32, 4>::new();
        assert_eq!(q.try_pop(), Err(Empty));
        for i in 0..4 {
            assert!(q.try_push(i).is_ok());
        }
        assert_eq!(q.try_push(99).unwrap_err().into_inner(), 99);
        for i in 0..4 {
            assert_eq!(q.try_pop(), Ok(i));
        }
        assert_eq!(q.try_pop(), Err(Empty));
    }

    #[test]
    fn len_special_cases_full() {
        let q = Queue::<u8, 4>::new();
        assert_eq!(q.len(), 0);
        for i in 0..4 {
            q.push(i).unwrap();
        }
        assert_eq!(q.len(), 4);
        assert!(q.is_full());
        q.pop().unwrap();
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn len_after_cursor_laps() {
        let q = Queue::<usize, 4>::new();
        for i in 0..10 {
            q.push(i).unwrap();
            q.pop().unwrap();
        }
        assert!(q.is_empty());
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn single_slot_queue_detects_full() {
        let q = Queue::<u8, 1>::with_config(Config::new().with_timeout(Duration::from_millis(5)));
        for round in 0..3 {
            q.push(round).unwrap();
            assert!(q.is_full());
            assert_eq!(q.try_push(9).unwrap_err().into_inner(), 9);
            assert!(q.push(9).is_err());
            assert_eq!(q.pop(), Ok(round));
            assert_eq!(q.try_pop(), Err(Empty));
        }
    }

    #[test]
    fn push_gives_up_on_a_reserved_but_unpublished_slot() {
        let q = Queue::<u8, 1>::with_config(Config::new().with_timeout(Duration::from_millis(5)));
        // A producer that won ticket 0 and has not written yet.
        q.insert.fetch_add(1, Ordering::SeqCst);

        assert_eq!(q.try_push(1).unwrap_err().into_inner(), 1);
        assert_eq!(q.push(2), Err(PushTimeout(2)));
        assert_eq!(q.try_pop(), Err(Empty));
    }

    #[test]
    fn pop_gives_up_on_a_slot_the_previous_lap_still_holds() {
        let q = Queue::<u8, 1>::with_config(Config::new().with_timeout(Duration::from_millis(5)));
        q.push(7).unwrap();
        // A consumer that won ticket 0 and has not released the slot yet.
        q.remove.fetch_add(1, Ordering::SeqCst);

        assert_eq!(q.try_pop(), Err(Empty));
        assert_eq!(q.pop(), Err(PopTimeout));
        assert_eq!(q.try_push(3).unwrap_err().into_inner(), 3);
    }

    #[test]
    fn len_clamps_when_cursors_are_far_apart() {
        let q = Queue::<u8, 4>::new();
        q.insert.fetch_add(6, Ordering::SeqCst);
        assert_eq!(q.len(), 4);
        q.remove.fetch_add(5, Ordering::SeqCst);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn capacity_errors() {
        assert_eq!(Queue::<u8, 0>::try_new().unwrap_err(), CapacityError::Zero);
        assert_eq!(
            Queue::<u8, 12>::try_new().unwrap_err(),
            CapacityError::NotPowerOfTwo(12)
        );
        assert!(Queue::<u8, 1>::try_new().is_ok());
    }

    #[test]
    fn zero_timeout_still_takes_a_free_slot() {
        let q = Queue::<u8, 2>::new();
        assert!(q.push_timeout(1, Duration::ZERO).is_ok());
        assert_eq!(q.pop_timeout(Duration::ZERO), Ok(1));
        assert_eq!(q.pop_timeout(Duration::ZERO), Err(PopTimeout));
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        let q = Queue::<u8, 2>::new();
        q.push_timeout(7, Duration::MAX).unwrap();
        assert_eq!(q.pop_timeout(Duration::MAX), Ok(7));
    }
}
