use std::sync::Arc;

use crate::{BoxError, Segment};

/// Leases fresh id ranges from an allocation authority.
///
/// Implementations are called from the refill worker thread, never from the
/// ID hot path, so they are free to block on I/O. Every call must return a
/// range disjoint from every range ever returned for the same `biz_tag`.
///
/// # Example
///
/// ```
/// use ginkgo_id::{Segment, SegmentProvider};
/// use std::sync::atomic::{AtomicI64, Ordering};
///
/// struct Local(AtomicI64);
///
/// impl SegmentProvider for Local {
///     fn allocate(&self, _biz_tag: &str, step: i64) -> Result<Segment, ginkgo_id::BoxError> {
///         let next_id = self.0.fetch_add(step, Ordering::Relaxed);
///         Ok(Segment::from_step(next_id, step)?)
///     }
/// }
///
/// let provider = Local(AtomicI64::new(0));
/// let segment = provider.allocate("order", 100).unwrap();
/// assert_eq!((segment.start(), segment.end()), (0, 99));
/// ```
pub trait SegmentProvider: Send + Sync {
    fn allocate(&self, biz_tag: &str, step: i64) -> Result<Segment, BoxError>;
}

/// Leases a machine id in `0..=255` for a snowflake generator.
pub trait MachineIdProvider: Send + Sync {
    fn allocate_machine_id(&self, biz_tag: &str) -> Result<i64, BoxError>;
}

impl<P: SegmentProvider + ?Sized> SegmentProvider for Arc<P> {
    fn allocate(&self, biz_tag: &str, step: i64) -> Result<Segment, BoxError> {
        (**self).allocate(biz_tag, step)
    }
}

impl<P: MachineIdProvider + ?Sized> MachineIdProvider for Arc<P> {
    fn allocate_machine_id(&self, biz_tag: &str) -> Result<i64, BoxError> {
        (**self).allocate_machine_id(biz_tag)
    }
}

impl<F> SegmentProvider for F
where
    F: Fn(&str, i64) -> Result<Segment, BoxError> + Send + Sync,
{
    fn allocate(&self, biz_tag: &str, step: i64) -> Result<Segment, BoxError> {
        self(biz_tag, step)
    }
}

impl<F> MachineIdProvider for F
where
    F: Fn(&str) -> Result<i64, BoxError> + Send + Sync,
{
    fn allocate_machine_id(&self, biz_tag: &str) -> Result<i64, BoxError> {
        self(biz_tag)
    }
}
