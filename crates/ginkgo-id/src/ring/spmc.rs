use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

use crate::{Error, Result};

/// A fixed-capacity single-producer/multi-consumer ring of heap values.
///
/// One producer thread appends at `tail`; any number of consumers inspect the
/// value at `head` and race to remove it. Removal is a compare-and-pop: a
/// consumer only removes the head if it still holds the exact instance the
/// consumer peeked, and the logical `head` counter is advanced by
/// compare-and-swap so exactly one consumer wins each slot.
///
/// Removed values are reclaimed through `crossbeam-epoch`: references handed
/// out by [`SpmcRing::peek`] stay valid for as long as the caller's [`Guard`]
/// is alive, even if another consumer pops the value in the meantime.
///
/// ## Invariants
/// - `head` and `tail` only increase; `0 <= tail - head <= capacity`.
/// - Only the producer stores into a slot, and only after the previous
///   occupant's consumer has cleared it.
pub struct SpmcRing<T> {
    slots: Box<[Atomic<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

impl<T> SpmcRing<T> {
    /// Creates a ring with room for at least `capacity` values. The capacity
    /// is rounded up to the next power of two.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRingSize`] if `capacity < 2` or rounding
    /// overflows.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = Some(capacity)
            .filter(|c| *c >= 2)
            .and_then(usize::checked_next_power_of_two)
            .ok_or(Error::InvalidRingSize { size: capacity })?;

        Ok(Self {
            slots: (0..capacity).map(|_| Atomic::null()).collect(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    pub const fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of buffered values, never more than [`Self::capacity`].
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Appends `value` at the tail, handing it back if the ring is full.
    ///
    /// Must only be called from the single producer thread.
    pub fn offer(&self, value: T) -> core::result::Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity() {
            return Err(value);
        }

        let guard = &epoch::pin();
        let slot = &self.slots[tail & self.mask];

        // The consumer that won the previous occupant advances `head` before
        // it clears the slot, so the slot may still be draining.
        let backoff = Backoff::new();
        while !slot.load(Ordering::Acquire, guard).is_null() {
            backoff.snooze();
        }

        slot.store(Owned::new(value), Ordering::Release);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Returns the value at the head without removing it.
    pub fn peek<'g>(&self, guard: &'g Guard) -> Option<&'g T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }

            let current = self.slots[head & self.mask].load(Ordering::Acquire, guard);
            // An unchanged head means the slot still holds occupant `head`,
            // not a later one written after it was popped.
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }
            // SAFETY: non-null slot pointers come from `Owned::new` and are
            // only released through `defer_destroy`, which cannot run while
            // `guard` is pinned.
            if let Some(value) = unsafe { current.as_ref() } {
                return Some(value);
            }
        }
    }

    /// Removes the head value, but only if it is still `expected`.
    ///
    /// `expected` must have been obtained from [`Self::peek`] under the same
    /// `guard`, which keeps its address from being reused. Returns `true` for
    /// exactly one caller per occupant; every other caller (or a caller whose
    /// occupant was already replaced) gets `false`.
    pub fn pop_if<'g>(&self, expected: &'g T, guard: &'g Guard) -> bool {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return false;
            }

            let slot = &self.slots[head & self.mask];
            let current = slot.load(Ordering::Acquire, guard);
            if !ptr::eq(current.as_raw(), expected) {
                return false;
            }

            if self
                .head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let taken = slot.swap(Shared::null(), Ordering::AcqRel, guard);
                debug_assert_eq!(taken, current);
                // SAFETY: winning the head CAS makes this the only thread that
                // unlinks `taken`; readers still holding it are pinned.
                unsafe { guard.defer_destroy(taken) };
                return true;
            }
        }
    }
}

impl<T> Drop for SpmcRing<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can observe the slots.
        let guard = unsafe { epoch::unprotected() };
        for slot in &*self.slots {
            let shared = slot.swap(Shared::null(), Ordering::Relaxed, guard);
            if !shared.is_null() {
                // SAFETY: see above; the pointer came from `Owned::new`.
                drop(unsafe { shared.into_owned() });
            }
        }
    }
}
