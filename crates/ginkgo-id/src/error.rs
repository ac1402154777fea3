use core::fmt;

/// Boxed error returned by [`SegmentProvider`] and [`MachineIdProvider`]
/// implementations.
///
/// Providers talk to the allocation authority over whatever transport they
/// like, so their failures are opaque to the generators. A failed segment
/// allocation is retried by the refill worker; a failed machine-id lease is a
/// construction error.
///
/// [`SegmentProvider`]: crate::SegmentProvider
/// [`MachineIdProvider`]: crate::MachineIdProvider
pub type BoxError = Box<dyn core::error::Error + Send + Sync + 'static>;

/// A result type defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors that `ginkgo-id` can produce.
///
/// Construction errors (`InvalidRingSize`, `InvalidSegment`,
/// `InvalidMachineId`, `InvalidConfig`, `Allocation`, `Spawn`) surface immediately and
/// are never retried. `NotStarted`, `Closed` and `Cancelled` are lifecycle
/// signals returned from the ID hot path instead of parking forever.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A ring buffer was requested with fewer than two slots.
    #[error("ring size must be >= 2, got {size}")]
    InvalidRingSize { size: usize },

    /// A segment was built with `end < start`, a non-positive step, or a
    /// range that overflows `i64`.
    #[error("invalid segment [{start}, {end}]")]
    InvalidSegment { start: i64, end: i64 },

    /// The leased machine id does not fit into the snowflake layout.
    #[error("machine id {machine_id} exceeds the maximum of {max}")]
    InvalidMachineId { machine_id: i64, max: i64 },

    /// A configuration value was rejected.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A machine id could not be leased from the allocation authority.
    #[error("allocation failed for biz tag `{biz_tag}`")]
    Allocation {
        biz_tag: String,
        #[source]
        source: BoxError,
    },

    /// The background worker thread could not be spawned.
    #[error("failed to spawn worker thread `{name}`")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The generator has not been started yet.
    #[error("generator has not been started")]
    NotStarted,

    /// The generator has been shut down.
    #[error("generator is closed")]
    Closed,

    /// A blocking wait was cancelled by the caller.
    #[error("wait cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn invalid_config(reason: impl fmt::Display) -> Self {
        Self::InvalidConfig {
            reason: reason.to_string(),
        }
    }
}
