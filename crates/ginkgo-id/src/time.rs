use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snowflake epoch: Tuesday, June 24, 2025 00:00:00 UTC+8
///
/// Every snowflake id encodes time relative to this instant. It must never
/// change for a deployment: moving it silently re-issues timestamps that were
/// already handed out.
pub const GINKGO_EPOCH: Duration = Duration::from_millis(1_750_694_400_000);

/// A trait for time sources that return a wall-clock timestamp.
///
/// This abstraction allows you to plug in the real system clock, or a mocked
/// time source in tests.
///
/// The unit is **milliseconds** relative to the clock's configured epoch. The
/// value is allowed to move backwards (NTP steps, VM migration); consumers
/// are expected to absorb regressions.
///
/// # Example
///
/// ```
/// use ginkgo_id::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// let time = FixedTime;
/// assert_eq!(time.current_millis(), 1234);
/// ```
pub trait TimeSource {
    /// Returns the current time in milliseconds since the configured epoch.
    fn current_millis(&self) -> u64;
}

/// A wall-clock time source offset from a fixed epoch.
///
/// Reads `SystemTime::now()` on every call. Instants before the epoch are
/// reported as `0`.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    epoch: Duration,
}

impl Default for SystemClock {
    /// Constructs a clock aligned to [`GINKGO_EPOCH`].
    fn default() -> Self {
        Self::with_epoch(GINKGO_EPOCH)
    }
}

impl SystemClock {
    /// Constructs a clock using a custom epoch as the origin (t = 0),
    /// specified as a [`Duration`] since 1970-01-01 UTC.
    pub const fn with_epoch(epoch: Duration) -> Self {
        Self { epoch }
    }

    /// The epoch this clock is anchored to.
    pub const fn epoch(&self) -> Duration {
        self.epoch
    }
}

impl TimeSource for SystemClock {
    fn current_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .and_then(|now| now.checked_sub(self.epoch))
            .map_or(0, |elapsed| elapsed.as_millis() as u64)
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}
