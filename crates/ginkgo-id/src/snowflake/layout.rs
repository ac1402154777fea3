use crate::{Error, Result, SystemClock, TimeSource};

/// Bits reserved for the timestamp tick.
pub const TIMESTAMP_BITS: u32 = 30;
/// Bits reserved for the machine id.
pub const MACHINE_ID_BITS: u32 = 8;
/// Bits reserved for the per-tick sequence.
pub const SEQUENCE_BITS: u32 = 25;

pub const MACHINE_ID_SHIFT: u32 = SEQUENCE_BITS;
pub const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + MACHINE_ID_BITS;

pub const MAX_MACHINE_ID: i64 = (1 << MACHINE_ID_BITS) - 1;
pub const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;

/// One tick is `2^14` milliseconds (16.384 s).
pub const TICK_SHIFT: u32 = 14;

/// Converts milliseconds since the epoch into a timestamp tick.
#[inline]
pub const fn tick_from_millis(millis: u64) -> i64 {
    (millis >> TICK_SHIFT) as i64
}

/// Packs the three fields into an id. Bit 63 stays clear.
#[inline]
pub const fn compose(tick: i64, machine_id: i64, sequence: i64) -> i64 {
    (tick << TIMESTAMP_SHIFT) | (machine_id << MACHINE_ID_SHIFT) | sequence
}

/// Splits an id into `(tick, machine_id, sequence)`.
#[inline]
pub const fn decompose(id: i64) -> (i64, i64, i64) {
    (
        id >> TIMESTAMP_SHIFT,
        (id >> MACHINE_ID_SHIFT) & MAX_MACHINE_ID,
        id & MAX_SEQUENCE,
    )
}

/// A single-owner snowflake bit-packer that fills whole batches per call.
///
/// ```text
///  Bit Index:  63   62          33 32        25 24                 0
///              +----+--------------+------------+-------------------+
///  Field:      | 0  | tick (30)    | machine (8)| sequence (25)     |
///              +----+--------------+------------+-------------------+
/// ```
///
/// Clock regressions are absorbed: a tick behind the last issued one is
/// clamped to it. When the 25-bit sequence overflows inside a batch the tick
/// is advanced by one rather than waiting for the clock, so the generator may
/// briefly run ahead of wall time under sustained load.
///
/// Not thread-safe by itself. The producer thread owns it exclusively.
#[derive(Debug)]
pub struct BatchSnowflake<T = SystemClock> {
    machine_id: i64,
    last_tick: i64,
    sequence: i64,
    clock: T,
}

impl BatchSnowflake<SystemClock> {
    /// Creates a generator reading the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMachineId`] if `machine_id` is outside
    /// `0..=255`.
    pub fn new(machine_id: i64) -> Result<Self> {
        Self::with_clock(machine_id, SystemClock::default())
    }
}

impl<T: TimeSource> BatchSnowflake<T> {
    /// Creates a generator with a custom time source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMachineId`] if `machine_id` is outside
    /// `0..=255`.
    pub fn with_clock(machine_id: i64, clock: T) -> Result<Self> {
        Self::from_components(machine_id, 0, 0, clock)
    }

    /// Creates a generator with explicit internal state. Mostly useful in
    /// tests to start close to a sequence rollover.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMachineId`] if `machine_id` is outside
    /// `0..=255`.
    pub fn from_components(machine_id: i64, last_tick: i64, sequence: i64, clock: T) -> Result<Self> {
        if !(0..=MAX_MACHINE_ID).contains(&machine_id) {
            return Err(Error::InvalidMachineId {
                machine_id,
                max: MAX_MACHINE_ID,
            });
        }
        Ok(Self {
            machine_id,
            last_tick,
            sequence,
            clock,
        })
    }

    pub const fn machine_id(&self) -> i64 {
        self.machine_id
    }

    pub const fn last_tick(&self) -> i64 {
        self.last_tick
    }

    /// Fills `out` with fresh ids and returns how many were written (always
    /// `out.len()`).
    pub fn generate_batch(&mut self, out: &mut [i64]) -> usize {
        let mut tick = tick_from_millis(self.clock.current_millis());
        if tick < self.last_tick {
            tick = self.last_tick;
        } else if tick > self.last_tick {
            self.sequence = 0;
        }
        self.last_tick = tick;

        for slot in out.iter_mut() {
            if self.sequence > MAX_SEQUENCE {
                tick += 1;
                self.sequence = 0;
                self.last_tick = tick;
            }
            *slot = compose(tick, self.machine_id, self.sequence);
            self.sequence += 1;
        }
        out.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    const TICK_MS: u64 = 1 << TICK_SHIFT;

    #[derive(Clone, Default)]
    struct MockTime {
        millis: Arc<AtomicU64>,
    }

    impl MockTime {
        fn at(millis: u64) -> Self {
            let time = Self::default();
            time.set(millis);
            time
        }

        fn set(&self, millis: u64) {
            self.millis.store(millis, Ordering::Relaxed);
        }
    }

    impl TimeSource for MockTime {
        fn current_millis(&self) -> u64 {
            self.millis.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn layout_constants() {
        assert_eq!(TIMESTAMP_BITS + MACHINE_ID_BITS + SEQUENCE_BITS, 63);
        assert_eq!(MACHINE_ID_SHIFT, 25);
        assert_eq!(TIMESTAMP_SHIFT, 33);
        assert_eq!(MAX_MACHINE_ID, 255);
        assert_eq!(MAX_SEQUENCE, 33_554_431);
        assert_eq!(tick_from_millis(TICK_MS - 1), 0);
        assert_eq!(tick_from_millis(TICK_MS), 1);
    }

    #[test]
    fn rejects_out_of_range_machine_ids() {
        assert!(matches!(
            BatchSnowflake::with_clock(256, MockTime::default()),
            Err(Error::InvalidMachineId {
                machine_id: 256,
                max: 255
            })
        ));
        assert!(BatchSnowflake::with_clock(-1, MockTime::default()).is_err());
        assert!(BatchSnowflake::with_clock(255, MockTime::default()).is_ok());
    }

    #[test]
    fn fields_round_trip_through_decompose() {
        let time = MockTime::at(42 * TICK_MS + 17);
        let mut generator = BatchSnowflake::with_clock(7, time).unwrap();
        let mut out = [0; 3];
        assert_eq!(generator.generate_batch(&mut out), 3);

        for (sequence, id) in out.iter().enumerate() {
            assert!(*id > 0);
            assert_eq!(decompose(*id), (42, 7, sequence as i64));
        }
    }

    #[test]
    fn sequence_continues_within_a_tick_and_resets_on_a_new_one() {
        let time = MockTime::at(5 * TICK_MS);
        let mut generator = BatchSnowflake::with_clock(1, time.clone()).unwrap();

        let mut first = [0; 4];
        generator.generate_batch(&mut first);
        let mut second = [0; 4];
        generator.generate_batch(&mut second);
        assert_eq!(decompose(second[0]), (5, 1, 4));

        time.set(6 * TICK_MS);
        let mut third = [0; 2];
        generator.generate_batch(&mut third);
        assert_eq!(decompose(third[0]), (6, 1, 0));
        assert!(third[0] > second[3]);
    }

    #[test]
    fn backward_clock_is_clamped() {
        let time = MockTime::at(100 * TICK_MS);
        let mut generator = BatchSnowflake::with_clock(3, time.clone()).unwrap();
        let mut before = [0; 8];
        generator.generate_batch(&mut before);

        time.set(90 * TICK_MS);
        let mut after = [0; 8];
        generator.generate_batch(&mut after);

        assert_eq!(generator.last_tick(), 100);
        assert_eq!(decompose(after[0]), (100, 3, 8));
        assert!(after.iter().all(|id| *id > before[7]));
    }

    #[test]
    fn sequence_overflow_rolls_the_tick_forward() {
        let time = MockTime::at(10 * TICK_MS);
        let mut generator =
            BatchSnowflake::from_components(9, 10, MAX_SEQUENCE - 1, time).unwrap();

        let mut out = [0; 4];
        generator.generate_batch(&mut out);

        assert_eq!(decompose(out[0]), (10, 9, MAX_SEQUENCE - 1));
        assert_eq!(decompose(out[1]), (10, 9, MAX_SEQUENCE));
        assert_eq!(decompose(out[2]), (11, 9, 0));
        assert_eq!(decompose(out[3]), (11, 9, 1));
        assert_eq!(generator.last_tick(), 11);
        assert!(out.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn stalled_clock_never_repeats() {
        let time = MockTime::at(TICK_MS);
        let mut generator =
            BatchSnowflake::from_components(0, 1, MAX_SEQUENCE - 1_000, time).unwrap();

        let mut seen = HashSet::new();
        let mut out = vec![0; 512];
        for _ in 0..16 {
            generator.generate_batch(&mut out);
            for id in &out {
                assert!(seen.insert(*id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 16 * 512);
    }

    #[test]
    fn pre_epoch_clock_maps_to_tick_zero() {
        let mut generator = BatchSnowflake::with_clock(1, MockTime::at(0)).unwrap();
        let mut out = [0; 1];
        generator.generate_batch(&mut out);
        assert_eq!(decompose(out[0]), (0, 1, 0));
        assert_eq!(out[0], 1 << MACHINE_ID_SHIFT);
    }
}
