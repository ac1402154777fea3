use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::Duration;

use crossbeam_epoch as epoch;
use portable_atomic::{AtomicBool, Ordering};
#[cfg(feature = "tracing")]
use tracing::instrument;

use super::lifecycle::{Lifecycle, LifecycleState};
use super::worker::{BackgroundWorker, StopSignal};
use crate::mutex::{Mutex, lock};
use crate::{Error, Result, Segment, SegmentProvider, SpmcRing};

/// Tuning knobs for a [`SegmentIdGenerator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentOptions {
    /// Size of every leased segment. Must be positive.
    pub step: i64,
    /// Number of segments buffered ahead of consumers. Rounded up to a power
    /// of two; must be at least 2.
    pub ring_size: usize,
    /// How long a consumer parks when no segment is buffered.
    pub partial_wait: Duration,
    /// Back-off between failed allocation attempts.
    pub retry_backoff: Duration,
    /// Upper bound on how long [`SegmentIdGenerator::shutdown`] waits for
    /// the refill worker.
    pub shutdown_timeout: Duration,
}

impl SegmentOptions {
    pub const DEFAULT_STEP: i64 = 10_000;
    pub const DEFAULT_RING_SIZE: usize = 8;
    pub const DEFAULT_PARTIAL_WAIT: Duration = Duration::from_micros(100);
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(step: i64, ring_size: usize) -> Self {
        Self {
            step,
            ring_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.step <= 0 {
            return Err(Error::invalid_config(format!(
                "segment step must be > 0, got {}",
                self.step
            )));
        }
        if self.ring_size < 2 {
            return Err(Error::InvalidRingSize {
                size: self.ring_size,
            });
        }
        Ok(())
    }
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            step: Self::DEFAULT_STEP,
            ring_size: Self::DEFAULT_RING_SIZE,
            partial_wait: Self::DEFAULT_PARTIAL_WAIT,
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Hands out ids from segments leased ahead of time from a
/// [`SegmentProvider`].
///
/// Consumers draw from the segment at the head of an [`SpmcRing`]. The
/// consumer that observes the head segment run dry removes it with a
/// compare-and-pop and asks the `segment-loader` worker to top the ring up.
/// Refill requests are coalesced: at most one refill pass runs at a time,
/// however many consumers ask.
///
/// Ids are unique across every generator sharing a `biz_tag` (the provider
/// guarantees disjoint ranges) and increase within one generator, but are not
/// globally ordered across generators.
///
/// ```
/// use ginkgo_id::{Segment, SegmentIdGenerator};
/// use std::sync::atomic::{AtomicI64, Ordering};
///
/// let cursor = AtomicI64::new(0);
/// let provider = move |_: &str, step: i64| -> Result<Segment, ginkgo_id::BoxError> {
///     Ok(Segment::from_step(cursor.fetch_add(step, Ordering::Relaxed), step)?)
/// };
///
/// let generator = SegmentIdGenerator::new(provider, "order", 100, 4).unwrap();
/// generator.start().unwrap();
/// assert_eq!(generator.next_id().unwrap(), 0);
/// assert_eq!(generator.next_id().unwrap(), 1);
/// generator.shutdown();
/// ```
pub struct SegmentIdGenerator<P> {
    shared: Arc<Shared<P>>,
    worker: Mutex<Option<BackgroundWorker>>,
}

struct Shared<P> {
    provider: P,
    biz_tag: String,
    options: SegmentOptions,
    ring: SpmcRing<Segment>,
    lifecycle: Lifecycle,
    refill_requested: AtomicBool,
    loader: OnceLock<Thread>,
}

impl<P> SegmentIdGenerator<P>
where
    P: SegmentProvider + 'static,
{
    /// Creates a generator leasing `step`-sized segments for `biz_tag`,
    /// buffering up to `ring_size` of them. Nothing is allocated until
    /// [`Self::start`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRingSize`] if `ring_size < 2`
    /// - [`Error::InvalidConfig`] if `step <= 0` or `biz_tag` is empty
    pub fn new(provider: P, biz_tag: impl Into<String>, step: i64, ring_size: usize) -> Result<Self> {
        Self::with_options(provider, biz_tag, SegmentOptions::new(step, ring_size))
    }

    /// Creates a generator with explicit timing options.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_options(provider: P, biz_tag: impl Into<String>, options: SegmentOptions) -> Result<Self> {
        let biz_tag = biz_tag.into();
        if biz_tag.is_empty() {
            return Err(Error::invalid_config("biz tag must not be empty"));
        }
        options.validate()?;
        let ring = SpmcRing::new(options.ring_size)?;

        Ok(Self {
            shared: Arc::new(Shared {
                provider,
                biz_tag,
                options,
                ring,
                lifecycle: Lifecycle::new(),
                refill_requested: AtomicBool::new(false),
                loader: OnceLock::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the refill worker and requests the initial fill. Calling it
    /// again while started is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the generator was already shut down
    /// - [`Error::Spawn`] if the worker thread could not be created
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), fields(biz_tag = %self.shared.biz_tag)))]
    pub fn start(&self) -> Result<()> {
        if !self.shared.lifecycle.start()? {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let worker = match BackgroundWorker::spawn("segment-loader", move |stop| shared.run(&stop)) {
            Ok(worker) => worker,
            Err(e) => {
                self.shared.lifecycle.shutdown();
                return Err(e);
            }
        };
        let _ = self.shared.loader.set(worker.thread().clone());
        *lock(&self.worker) = Some(worker);

        self.shared.request_refill();
        #[cfg(feature = "tracing")]
        tracing::debug!(capacity = self.shared.ring.capacity(), step = self.shared.options.step, "segment generator started");
        Ok(())
    }
}

impl<P: SegmentProvider> SegmentIdGenerator<P> {
    /// Returns the next id, parking briefly while no segment is buffered.
    ///
    /// # Errors
    ///
    /// - [`Error::NotStarted`] before [`Self::start`]
    /// - [`Error::Closed`] after [`Self::shutdown`]
    pub fn next_id(&self) -> Result<i64> {
        let shared = &*self.shared;
        loop {
            shared.lifecycle.ensure_running()?;

            let guard = epoch::pin();
            let Some(segment) = shared.ring.peek(&guard) else {
                drop(guard);
                shared.request_refill();
                thread::park_timeout(shared.options.partial_wait);
                continue;
            };

            if let Some(id) = segment.next_id() {
                return Ok(id);
            }
            if shared.ring.pop_if(segment, &guard) {
                shared.request_refill();
            }
        }
    }

    /// Stops the refill worker and waits for it up to the configured
    /// shutdown timeout. Later [`Self::next_id`] calls fail with
    /// [`Error::Closed`]. Idempotent.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), fields(biz_tag = %self.shared.biz_tag)))]
    pub fn shutdown(&self) {
        if self.shared.lifecycle.shutdown() == LifecycleState::Shutdown {
            return;
        }
        if let Some(mut worker) = lock(&self.worker).take() {
            worker.shutdown(self.shared.options.shutdown_timeout);
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    pub fn biz_tag(&self) -> &str {
        &self.shared.biz_tag
    }

    pub fn options(&self) -> &SegmentOptions {
        &self.shared.options
    }

    /// Ids left in the segment consumers are currently drawing from, or `0`
    /// when nothing is buffered.
    pub fn current_segment_remaining(&self) -> i64 {
        let guard = &epoch::pin();
        self.shared.ring.peek(guard).map_or(0, Segment::remaining)
    }

    /// Number of segments buffered, including the one being drawn from.
    pub fn buffered_segments(&self) -> usize {
        self.shared.ring.len()
    }

    /// Ring capacity in segments.
    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }
}

impl<P> Drop for SegmentIdGenerator<P> {
    fn drop(&mut self) {
        self.shared.lifecycle.shutdown();
    }
}

impl<P> core::fmt::Debug for SegmentIdGenerator<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentIdGenerator")
            .field("biz_tag", &self.shared.biz_tag)
            .field("options", &self.shared.options)
            .field("state", &self.shared.lifecycle.state())
            .field("buffered_segments", &self.shared.ring.len())
            .finish_non_exhaustive()
    }
}

impl<P: SegmentProvider> Shared<P> {
    /// Flags that the ring wants topping up. Only the request that flips the
    /// flag wakes the worker.
    fn request_refill(&self) {
        if !self.refill_requested.swap(true, Ordering::AcqRel) {
            if let Some(loader) = self.loader.get() {
                loader.unpark();
            }
        }
    }

    fn run(&self, stop: &StopSignal) {
        while !stop.is_stopped() {
            if self.refill_requested.swap(false, Ordering::AcqRel) {
                self.refill(stop);
            } else {
                thread::park();
            }
        }
    }

    /// Allocates segments until the ring is full. Failed allocations are
    /// retried after a back-off until they succeed or the worker is stopped.
    fn refill(&self, stop: &StopSignal) {
        while !self.ring.is_full() {
            if stop.is_stopped() {
                return;
            }
            match self.provider.allocate(&self.biz_tag, self.options.step) {
                Ok(segment) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(start = segment.start(), end = segment.end(), "segment leased");
                    if self.ring.offer(segment).is_err() {
                        return;
                    }
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        biz_tag = %self.biz_tag,
                        error = %_e,
                        backoff = ?self.options.retry_backoff,
                        "segment allocation failed"
                    );
                    if stop.sleep(self.options.retry_backoff) {
                        return;
                    }
                }
            }
        }
    }
}
