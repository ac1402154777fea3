use portable_atomic::{AtomicI64, Ordering};

use crate::{Error, Result};

/// A contiguous, exclusively-owned range of ids `[start, end]`.
///
/// The cursor only ever moves forward. Once it passes `end` the segment is
/// exhausted and stays exhausted: every later [`Segment::next_id`] call
/// returns `None`.
///
/// Any number of threads may draw from the same segment concurrently; each id
/// is handed out at most once.
#[derive(Debug)]
pub struct Segment {
    start: i64,
    end: i64,
    current: AtomicI64,
}

impl Segment {
    /// Creates a segment covering `[start, end]` (both inclusive).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSegment`] if `end < start`.
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidSegment { start, end });
        }
        Ok(Self {
            start,
            end,
            current: AtomicI64::new(start),
        })
    }

    /// Creates the segment `[next_id, next_id + step - 1]` described by an
    /// allocation authority response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSegment`] if `step` is not positive or the
    /// range overflows `i64`.
    pub fn from_step(next_id: i64, step: i64) -> Result<Self> {
        let end = step
            .checked_sub(1)
            .filter(|_| step > 0)
            .and_then(|span| next_id.checked_add(span))
            .ok_or(Error::InvalidSegment {
                start: next_id,
                end: next_id.saturating_add(step).saturating_sub(1),
            })?;
        Self::new(next_id, end)
    }

    /// Hands out the next id, or `None` once the segment is exhausted.
    ///
    /// This is a single atomic increment followed by a bounds check.
    /// Exhaustion is the common case at segment boundaries, so it is reported
    /// as a value rather than an error.
    #[inline]
    pub fn next_id(&self) -> Option<i64> {
        let id = self.current.fetch_add(1, Ordering::Relaxed);
        // `id < start` catches the cursor wrapping past i64::MAX.
        if id > self.end || id < self.start {
            None
        } else {
            Some(id)
        }
    }

    pub const fn start(&self) -> i64 {
        self.start
    }

    pub const fn end(&self) -> i64 {
        self.end
    }

    /// Number of ids in the segment.
    pub const fn size(&self) -> i64 {
        self.end - self.start + 1
    }

    /// Number of ids handed out so far, at most [`Self::size`].
    pub fn used(&self) -> i64 {
        let current = self.current.load(Ordering::Relaxed);
        if current < self.start {
            // wrapped
            return self.size();
        }
        (current - self.start).min(self.size())
    }

    /// Number of ids still available, never negative.
    pub fn remaining(&self) -> i64 {
        self.size() - self.used()
    }

    /// Fraction of the segment already handed out, in `[0.0, 1.0]`.
    pub fn usage_ratio(&self) -> f64 {
        self.used() as f64 / self.size() as f64
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}
