use std::sync::OnceLock;
use std::thread::Thread;

use crossbeam_utils::CachePadded;
use portable_atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::{Error, Result};

/// A bounded ring of pre-generated ids that wakes its producer when the
/// buffered count drops to a watermark.
///
/// - Exactly one producer calls [`offer`](Self::offer) /
///   [`batch_offer`](Self::batch_offer).
/// - Any number of consumers call [`poll`](Self::poll) /
///   [`batch_poll`](Self::batch_poll). The read index is advanced by
///   compare-and-swap, so no slot is ever handed to two consumers.
///
/// Once occupancy is at or below `capacity * 3 / 4` the ring raises
/// `needs_filling` and unparks the registered producer thread. While a fill is
/// in progress no further wake-ups are issued.
pub struct WatermarkRing {
    slots: Box<[AtomicI64]>,
    mask: u64,
    fill_trigger_level: usize,
    read_index: CachePadded<AtomicU64>,
    write_index: CachePadded<AtomicU64>,
    needs_filling: AtomicBool,
    fill_in_progress: AtomicBool,
    producer: OnceLock<Thread>,
}

impl WatermarkRing {
    /// Creates a ring with room for at least `capacity` ids, rounded up to the
    /// next power of two.
    ///
    /// A fresh ring starts out flagged as needing a fill.
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
            slots: (0..capacity).map(|_| AtomicI64::new(0)).collect(),
            mask: capacity as u64 - 1,
            fill_trigger_level: capacity * 3 / 4,
            read_index: CachePadded::new(AtomicU64::new(0)),
            write_index: CachePadded::new(AtomicU64::new(0)),
            needs_filling: AtomicBool::new(true),
            fill_in_progress: AtomicBool::new(false),
            producer: OnceLock::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub const fn fill_trigger_level(&self) -> usize {
        self.fill_trigger_level
    }

    /// Number of buffered ids, never more than [`Self::capacity`].
    pub fn len(&self) -> usize {
        let read = self.read_index.load(Ordering::Acquire);
        let write = self.write_index.load(Ordering::Acquire);
        (write.saturating_sub(read) as usize).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Registers the thread to unpark on a watermark crossing. Only the first
    /// registration takes effect.
    pub fn register_producer(&self, thread: Thread) {
        let _ = self.producer.set(thread);
    }

    pub fn needs_filling(&self) -> bool {
        self.needs_filling.load(Ordering::Acquire)
    }

    pub fn is_fill_in_progress(&self) -> bool {
        self.fill_in_progress.load(Ordering::Acquire)
    }

    pub fn mark_fill_start(&self) {
        self.fill_in_progress.store(true, Ordering::Release);
        self.needs_filling.store(false, Ordering::Release);
    }

    /// Ends a fill and re-evaluates the watermark, since consumers may have
    /// drained the ring below it while wake-ups were suppressed.
    pub fn mark_fill_complete(&self) {
        self.fill_in_progress.store(false, Ordering::Release);
        self.check_watermark();
    }

    /// Appends one id. Returns `false` when the ring is full.
    ///
    /// Producer only.
    pub fn offer(&self, value: i64) -> bool {
        let write = self.write_index.load(Ordering::Relaxed);
        let read = self.read_index.load(Ordering::Acquire);
        if write - read >= self.capacity() as u64 {
            return false;
        }
        self.slots[(write & self.mask) as usize].store(value, Ordering::Relaxed);
        self.write_index.store(write + 1, Ordering::Release);
        self.check_watermark();
        true
    }

    /// Appends as many ids from `values` as fit and returns how many were
    /// taken. A batch that crosses the end of the slot array wraps to the
    /// front.
    ///
    /// Producer only.
    pub fn batch_offer(&self, values: &[i64]) -> usize {
        let write = self.write_index.load(Ordering::Relaxed);
        let read = self.read_index.load(Ordering::Acquire);
        let free = self.capacity() - (write - read) as usize;
        let count = values.len().min(free);
        if count == 0 {
            return 0;
        }

        let start = (write & self.mask) as usize;
        let (head, tail) = values[..count].split_at(count.min(self.capacity() - start));
        for (slot, value) in self.slots[start..].iter().zip(head) {
            slot.store(*value, Ordering::Relaxed);
        }
        for (slot, value) in self.slots.iter().zip(tail) {
            slot.store(*value, Ordering::Relaxed);
        }

        self.write_index.store(write + count as u64, Ordering::Release);
        self.check_watermark();
        count
    }

    /// Takes the oldest id, or `None` when the ring is empty.
    pub fn poll(&self) -> Option<i64> {
        let mut read = self.read_index.load(Ordering::Acquire);
        loop {
            let write = self.write_index.load(Ordering::Acquire);
            if read >= write {
                self.check_watermark();
                return None;
            }

            let value = self.slots[(read & self.mask) as usize].load(Ordering::Relaxed);
            match self.read_index.compare_exchange_weak(
                read,
                read + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.check_watermark();
                    return Some(value);
                }
                Err(current) => read = current,
            }
        }
    }

    /// Takes up to `out.len()` ids in one step and returns how many were
    /// written to the front of `out`.
    pub fn batch_poll(&self, out: &mut [i64]) -> usize {
        let mut read = self.read_index.load(Ordering::Acquire);
        loop {
            let write = self.write_index.load(Ordering::Acquire);
            let count = ((write.saturating_sub(read)) as usize).min(out.len());
            if count == 0 {
                self.check_watermark();
                return 0;
            }

            let start = (read & self.mask) as usize;
            let first = count.min(self.capacity() - start);
            for (dst, slot) in out[..first].iter_mut().zip(&self.slots[start..]) {
                *dst = slot.load(Ordering::Relaxed);
            }
            for (dst, slot) in out[first..count].iter_mut().zip(self.slots.iter()) {
                *dst = slot.load(Ordering::Relaxed);
            }

            match self.read_index.compare_exchange_weak(
                read,
                read + count as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.check_watermark();
                    return count;
                }
                Err(current) => read = current,
            }
        }
    }

    /// Raises `needs_filling` and wakes the producer once occupancy is at or
    /// below the trigger level.
    fn check_watermark(&self) {
        if self.len() > self.fill_trigger_level
            || self.fill_in_progress.load(Ordering::Acquire)
        {
            return;
        }
        if self
            .needs_filling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(producer) = self.producer.get() {
                producer.unpark();
            }
        }
    }
}

impl core::fmt::Debug for WatermarkRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WatermarkRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("fill_trigger_level", &self.fill_trigger_level)
            .field("needs_filling", &self.needs_filling())
            .field("fill_in_progress", &self.is_fill_in_progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread::scope;

    fn filled(capacity: usize) -> WatermarkRing {
        let ring = WatermarkRing::new(capacity).unwrap();
        ring.mark_fill_start();
        let values: Vec<i64> = (0..ring.capacity() as i64).collect();
        assert_eq!(ring.batch_offer(&values), ring.capacity());
        ring.mark_fill_complete();
        ring
    }

    #[test]
    fn capacity_and_trigger_level() {
        let ring = WatermarkRing::new(6).unwrap();
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.fill_trigger_level(), 6);
        assert!(ring.needs_filling());
        assert!(WatermarkRing::new(1).is_err());
    }

    #[test]
    fn offer_and_poll_are_fifo() {
        let ring = WatermarkRing::new(4).unwrap();
        assert!(ring.offer(7));
        assert!(ring.offer(8));
        assert_eq!(ring.poll(), Some(7));
        assert_eq!(ring.poll(), Some(8));
        assert_eq!(ring.poll(), None);
    }

    #[test]
    fn offer_rejects_when_full() {
        let ring = filled(4);
        assert!(!ring.offer(100));
        assert_eq!(ring.batch_offer(&[1, 2, 3]), 0);
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn batch_offer_is_truncated_to_free_space() {
        let ring = WatermarkRing::new(4).unwrap();
        assert_eq!(ring.batch_offer(&[1, 2, 3, 4, 5, 6]), 4);
        let mut out = [0; 8];
        assert_eq!(ring.batch_poll(&mut out), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn batches_wrap_around_the_slot_array() {
        let ring = WatermarkRing::new(8).unwrap();
        assert_eq!(ring.batch_offer(&[0, 1, 2, 3, 4, 5]), 6);
        let mut out = [0; 5];
        assert_eq!(ring.batch_poll(&mut out), 5);

        // write index sits at slot 6; this batch spans slots 6, 7, 0, 1, 2
        assert_eq!(ring.batch_offer(&[10, 11, 12, 13, 14]), 5);
        let mut out = [0; 8];
        assert_eq!(ring.batch_poll(&mut out), 6);
        assert_eq!(&out[..6], &[5, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn watermark_crossing_sets_needs_filling() {
        let ring = filled(8);
        assert!(!ring.needs_filling());

        // 8 -> 7 is still above the trigger level of 6
        ring.poll();
        assert!(!ring.needs_filling());

        // 7 -> 6 reaches it
        ring.poll();
        assert!(ring.needs_filling());
    }

    #[test]
    fn no_trigger_while_fill_in_progress() {
        let ring = filled(8);
        ring.mark_fill_start();
        let mut out = [0; 8];
        ring.batch_poll(&mut out);
        assert!(!ring.needs_filling());

        // completing the fill notices the ring was drained meanwhile
        ring.mark_fill_complete();
        assert!(ring.needs_filling());
        assert_eq!(ring.poll(), None);
    }

    #[test]
    fn watermark_unparks_registered_producer() {
        let ring = filled(8);
        let woke = std::sync::atomic::AtomicBool::new(false);

        scope(|s| {
            let waiter = s.spawn(|| {
                while !ring.needs_filling() {
                    std::thread::park();
                }
                woke.store(true, Ordering::SeqCst);
            });
            ring.register_producer(waiter.thread().clone());

            let mut out = [0; 4];
            ring.batch_poll(&mut out);
        });

        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_consumers_observe_each_id_once() {
        const IDS: i64 = 50_000;
        const CONSUMERS: usize = 8;

        let ring = WatermarkRing::new(1024).unwrap();
        let taken = AtomicUsize::new(0);
        let seen = Mutex::new(HashSet::with_capacity(IDS as usize));

        scope(|s| {
            s.spawn(|| {
                let mut next = 0;
                while next < IDS {
                    let end = (next + 64).min(IDS);
                    let batch: Vec<i64> = (next..end).collect();
                    next += ring.batch_offer(&batch) as i64;
                    std::thread::yield_now();
                }
            });

            for worker in 0..CONSUMERS {
                let (ring, taken, seen) = (&ring, &taken, &seen);
                s.spawn(move || {
                    let mut local = Vec::new();
                    let mut out = [0; 16];
                    while taken.load(Ordering::Relaxed) < IDS as usize {
                        if worker % 2 == 0 {
                            if let Some(id) = ring.poll() {
                                taken.fetch_add(1, Ordering::Relaxed);
                                local.push(id);
                            }
                        } else {
                            let n = ring.batch_poll(&mut out);
                            taken.fetch_add(n, Ordering::Relaxed);
                            local.extend_from_slice(&out[..n]);
                        }
                    }
                    let mut seen = seen.lock().unwrap();
                    for id in local {
                        assert!(seen.insert(id), "id {id} observed twice");
                    }
                });
            }
        });

        assert_eq!(seen.into_inner().unwrap().len(), IDS as usize);
    }
}
