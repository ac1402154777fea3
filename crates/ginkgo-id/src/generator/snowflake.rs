use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
#[cfg(feature = "tracing")]
use tracing::instrument;

use super::lifecycle::{Lifecycle, LifecycleState};
use super::worker::BackgroundWorker;
use crate::mutex::{Mutex, lock};
use crate::snowflake::Producer;
use crate::{
    BatchSnowflake, Error, MachineIdProvider, Result, SystemClock, TimeSource, WatermarkRing,
};

/// Busy-spin iterations before a blocked consumer starts parking.
const MAX_SPIN: u32 = 1_000;
/// Park interval for a blocked consumer once spinning gives up.
const CONSUMER_PARK: Duration = Duration::from_micros(10);

/// Tuning knobs for a [`SnowflakeIdGenerator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnowflakeOptions {
    /// Ids buffered ahead of consumers. Rounded up to a power of two.
    pub buffer_size: usize,
    /// Ids generated per producer batch.
    pub fill_batch_size: usize,
    /// Longest the producer parks while the buffer is above its watermark.
    pub max_idle_time: Duration,
    /// How long [`SnowflakeIdGenerator::start`] waits for the first fill.
    pub startup_delay: Duration,
    /// Upper bound on how long [`SnowflakeIdGenerator::shutdown`] waits for
    /// the producer.
    pub shutdown_timeout: Duration,
}

impl SnowflakeOptions {
    pub const DEFAULT_BUFFER_SIZE: usize = 1 << 20;
    pub const DEFAULT_FILL_BATCH_SIZE: usize = 1 << 14;
    pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_millis(5_000);
    pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_millis(100);
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(buffer_size: usize, fill_batch_size: usize, max_idle_time: Duration) -> Self {
        Self {
            buffer_size,
            fill_batch_size,
            max_idle_time,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < 2 {
            return Err(Error::InvalidRingSize {
                size: self.buffer_size,
            });
        }
        if self.fill_batch_size == 0 {
            return Err(Error::invalid_config("fill batch size must be > 0"));
        }
        if self.max_idle_time.is_zero() {
            return Err(Error::invalid_config("max idle time must be > 0"));
        }
        Ok(())
    }
}

impl Default for SnowflakeOptions {
    fn default() -> Self {
        Self {
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            fill_batch_size: Self::DEFAULT_FILL_BATCH_SIZE,
            max_idle_time: Self::DEFAULT_MAX_IDLE_TIME,
            startup_delay: Self::DEFAULT_STARTUP_DELAY,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Serves snowflake ids out of a pre-filled [`WatermarkRing`].
///
/// A dedicated `snowflake-producer` thread owns the [`BatchSnowflake`] and
/// refills the ring whenever it drains to three quarters of capacity, so the
/// consumer path is a single compare-and-swap on the read index.
///
/// ```
/// use ginkgo_id::{SnowflakeIdGenerator, SnowflakeOptions, decompose};
/// use std::time::Duration;
///
/// let options = SnowflakeOptions::new(1024, 256, Duration::from_millis(50));
/// let generator = SnowflakeIdGenerator::new(7, options).unwrap();
/// generator.start().unwrap();
///
/// let id = generator.next_id().unwrap();
/// let (_tick, machine_id, _sequence) = decompose(id);
/// assert_eq!(machine_id, 7);
/// generator.shutdown();
/// ```
pub struct SnowflakeIdGenerator<T = SystemClock> {
    ring: Arc<WatermarkRing>,
    lifecycle: Lifecycle,
    machine_id: i64,
    options: SnowflakeOptions,
    generator: Mutex<Option<BatchSnowflake<T>>>,
    worker: Mutex<Option<BackgroundWorker>>,
}

impl SnowflakeIdGenerator<SystemClock> {
    /// Creates a generator for `machine_id` reading the system clock.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidMachineId`] if `machine_id` is outside `0..=255`
    /// - [`Error::InvalidRingSize`] / [`Error::InvalidConfig`] for bad options
    pub fn new(machine_id: i64, options: SnowflakeOptions) -> Result<Self> {
        Self::with_clock(machine_id, options, SystemClock::default())
    }

    /// Leases a machine id for `biz_tag` once, then creates the generator.
    ///
    /// # Errors
    ///
    /// - [`Error::Allocation`] if the provider fails
    /// - anything [`Self::new`] returns
    pub fn from_provider<P>(provider: &P, biz_tag: &str, options: SnowflakeOptions) -> Result<Self>
    where
        P: MachineIdProvider + ?Sized,
    {
        let machine_id =
            provider
                .allocate_machine_id(biz_tag)
                .map_err(|source| Error::Allocation {
                    biz_tag: biz_tag.to_owned(),
                    source,
                })?;
        #[cfg(feature = "tracing")]
        tracing::info!(biz_tag, machine_id, "machine id leased");
        Self::new(machine_id, options)
    }
}

impl<T> SnowflakeIdGenerator<T>
where
    T: TimeSource + Send + 'static,
{
    /// Creates a generator with a custom time source.
    ///
    /// # Errors
    ///
    /// See [`SnowflakeIdGenerator::new`].
    pub fn with_clock(machine_id: i64, options: SnowflakeOptions, clock: T) -> Result<Self> {
        options.validate()?;
        let generator = BatchSnowflake::with_clock(machine_id, clock)?;
        let ring = WatermarkRing::new(options.buffer_size)?;

        Ok(Self {
            ring: Arc::new(ring),
            lifecycle: Lifecycle::new(),
            machine_id,
            options,
            generator: Mutex::new(Some(generator)),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the producer and waits the startup delay so the first fill has
    /// landed. Calling it again while started is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the generator was already shut down
    /// - [`Error::Spawn`] if the producer thread could not be created
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), fields(machine_id = self.machine_id)))]
    pub fn start(&self) -> Result<()> {
        if !self.lifecycle.start()? {
            return Ok(());
        }
        let Some(generator) = lock(&self.generator).take() else {
            return Ok(());
        };

        let producer = Producer::new(
            Arc::clone(&self.ring),
            generator,
            self.options.fill_batch_size,
            self.options.max_idle_time,
        );
        let worker = match BackgroundWorker::spawn("snowflake-producer", move |stop| {
            producer.run(&stop);
        }) {
            Ok(worker) => worker,
            Err(e) => {
                self.lifecycle.shutdown();
                return Err(e);
            }
        };
        self.ring.register_producer(worker.thread().clone());
        *lock(&self.worker) = Some(worker);

        thread::sleep(self.options.startup_delay);
        #[cfg(feature = "tracing")]
        tracing::debug!(buffered = self.ring.len(), capacity = self.ring.capacity(), "snowflake generator started");
        Ok(())
    }
}

impl<T> SnowflakeIdGenerator<T> {
    /// Takes a buffered id without blocking. `None` if the buffer is empty or
    /// the generator is not running.
    #[inline]
    pub fn try_next_id(&self) -> Option<i64> {
        self.lifecycle.ensure_running().ok()?;
        self.ring.poll()
    }

    /// Waits for an id: spins briefly, then parks in short intervals.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] once `cancel` is triggered
    /// - [`Error::NotStarted`] before [`Self::start`]
    /// - [`Error::Closed`] after [`Self::shutdown`]
    pub fn next_id_blocking(&self, cancel: &CancellationToken) -> Result<i64> {
        self.wait_for_id(|| cancel.is_cancelled())
    }

    /// Like [`Self::next_id_blocking`] without a way to cancel.
    ///
    /// # Errors
    ///
    /// - [`Error::NotStarted`] before [`Self::start`]
    /// - [`Error::Closed`] after [`Self::shutdown`]
    #[inline]
    pub fn next_id(&self) -> Result<i64> {
        self.wait_for_id(|| false)
    }

    /// Takes up to `out.len()` buffered ids without blocking and returns how
    /// many were written to the front of `out`.
    pub fn next_ids(&self, out: &mut [i64]) -> usize {
        if self.lifecycle.ensure_running().is_err() {
            return 0;
        }
        self.ring.batch_poll(out)
    }

    fn wait_for_id(&self, cancelled: impl Fn() -> bool) -> Result<i64> {
        let mut spins = 0;
        loop {
            self.lifecycle.ensure_running()?;
            if cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(id) = self.ring.poll() {
                return Ok(id);
            }
            if spins < MAX_SPIN {
                core::hint::spin_loop();
                spins += 1;
            } else {
                thread::park_timeout(CONSUMER_PARK);
            }
        }
    }

    /// Stops the producer and waits for it up to the configured shutdown
    /// timeout. Later id requests fail with [`Error::Closed`]. Idempotent.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), fields(machine_id = self.machine_id)))]
    pub fn shutdown(&self) {
        if self.lifecycle.shutdown() == LifecycleState::Shutdown {
            return;
        }
        if let Some(mut worker) = lock(&self.worker).take() {
            worker.shutdown(self.options.shutdown_timeout);
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub const fn machine_id(&self) -> i64 {
        self.machine_id
    }

    pub fn options(&self) -> &SnowflakeOptions {
        &self.options
    }

    /// Number of ids currently buffered.
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Buffer capacity in ids.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T> core::fmt::Debug for SnowflakeIdGenerator<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SnowflakeIdGenerator")
            .field("machine_id", &self.machine_id)
            .field("options", &self.options)
            .field("state", &self.lifecycle.state())
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}
