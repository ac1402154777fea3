use crate::{
    BoxError, Error, GeneratorConfig, GeneratorKind, IdGenerator, LifecycleState,
    MachineIdProvider, Segment, SegmentIdGenerator, SegmentOptions, SegmentProvider,
    SnowflakeIdGenerator, SnowflakeOptions, TimeSource, decompose,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::scope;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Hands out consecutive ranges from an in-process cursor, like a single
/// authority would.
#[derive(Default)]
struct LocalAuthority {
    next: AtomicI64,
    machine_id: i64,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl LocalAuthority {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SegmentProvider for LocalAuthority {
    fn allocate(&self, _biz_tag: &str, step: i64) -> Result<Segment, BoxError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let next_id = self.next.fetch_add(step, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Segment::from_step(next_id, step)?)
    }
}

impl MachineIdProvider for LocalAuthority {
    fn allocate_machine_id(&self, _biz_tag: &str) -> Result<i64, BoxError> {
        Ok(self.machine_id)
    }
}

/// Fails the first `failures` allocations, then delegates.
struct FlakyAuthority {
    failures: AtomicUsize,
    inner: LocalAuthority,
}

impl SegmentProvider for FlakyAuthority {
    fn allocate(&self, biz_tag: &str, step: i64) -> Result<Segment, BoxError> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err("authority unavailable".into());
        }
        self.inner.allocate(biz_tag, step)
    }
}

struct DownAuthority;

impl SegmentProvider for DownAuthority {
    fn allocate(&self, _biz_tag: &str, _step: i64) -> Result<Segment, BoxError> {
        Err("authority unavailable".into())
    }
}

impl MachineIdProvider for DownAuthority {
    fn allocate_machine_id(&self, _biz_tag: &str) -> Result<i64, BoxError> {
        Err("authority unavailable".into())
    }
}

#[derive(Clone, Default)]
struct MockTime {
    millis: Arc<AtomicU64>,
}

impl TimeSource for MockTime {
    fn current_millis(&self) -> u64 {
        self.millis.load(Ordering::Relaxed)
    }
}

fn fast_segment_options(step: i64, ring_size: usize) -> SegmentOptions {
    SegmentOptions {
        retry_backoff: Duration::from_millis(5),
        ..SegmentOptions::new(step, ring_size)
    }
}

fn small_snowflake_options() -> SnowflakeOptions {
    SnowflakeOptions {
        startup_delay: Duration::from_millis(20),
        ..SnowflakeOptions::new(1 << 12, 256, Duration::from_millis(20))
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn segment_rejects_bad_arguments() {
    assert!(matches!(
        SegmentIdGenerator::new(LocalAuthority::default(), "order", 10, 1),
        Err(Error::InvalidRingSize { size: 1 })
    ));
    assert!(matches!(
        SegmentIdGenerator::new(LocalAuthority::default(), "order", 0, 4),
        Err(Error::InvalidConfig { .. })
    ));
    assert!(matches!(
        SegmentIdGenerator::new(LocalAuthority::default(), "", 10, 4),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn segment_requires_start() {
    let generator = SegmentIdGenerator::new(LocalAuthority::default(), "order", 10, 2).unwrap();
    assert_eq!(generator.state(), LifecycleState::Created);
    assert!(matches!(generator.next_id(), Err(Error::NotStarted)));
}

#[test]
fn segment_ids_are_contiguous_for_a_single_consumer() {
    let generator = SegmentIdGenerator::new(LocalAuthority::default(), "order", 10, 2).unwrap();
    generator.start().unwrap();

    for expected in 0..100 {
        assert_eq!(generator.next_id().unwrap(), expected);
    }
    generator.shutdown();
}

#[test]
fn segment_fills_ring_after_start() {
    let authority = Arc::new(LocalAuthority::default());
    let generator = SegmentIdGenerator::new(Arc::clone(&authority), "order", 100, 4).unwrap();
    assert_eq!(generator.capacity(), 4);
    assert_eq!(generator.current_segment_remaining(), 0);

    generator.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || generator.buffered_segments() == 4));
    assert_eq!(generator.current_segment_remaining(), 100);
    assert_eq!(authority.calls(), 4);

    generator.next_id().unwrap();
    assert_eq!(generator.current_segment_remaining(), 99);
    generator.shutdown();
}

#[test]
fn segment_concurrent_ids_are_unique() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 2_000;

    let generator = SegmentIdGenerator::new(LocalAuthority::default(), "order", 100, 4).unwrap();
    generator.start().unwrap();
    let seen = Mutex::new(HashSet::with_capacity(THREADS * PER_THREAD));

    scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let mut local = Vec::with_capacity(PER_THREAD);
                let mut last = -1;
                for _ in 0..PER_THREAD {
                    let id = generator.next_id().unwrap();
                    assert!(id > last, "ids must increase per thread");
                    last = id;
                    local.push(id);
                }
                let mut seen = seen.lock().unwrap();
                for id in local {
                    assert!(seen.insert(id), "duplicate id {id}");
                }
            });
        }
    });

    assert_eq!(seen.into_inner().unwrap().len(), THREADS * PER_THREAD);
    generator.shutdown();
}

#[test]
fn segment_refills_never_run_in_parallel() {
    let authority = Arc::new(LocalAuthority::with_delay(Duration::from_millis(1)));
    let generator = SegmentIdGenerator::new(Arc::clone(&authority), "order", 5, 2).unwrap();
    generator.start().unwrap();

    scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..200 {
                    generator.next_id().unwrap();
                }
            });
        }
    });

    assert_eq!(authority.max_in_flight.load(Ordering::SeqCst), 1);
    generator.shutdown();
}

#[test]
fn segment_survives_transient_allocation_failures() {
    let authority = FlakyAuthority {
        failures: AtomicUsize::new(3),
        inner: LocalAuthority::default(),
    };
    let generator =
        SegmentIdGenerator::with_options(authority, "order", fast_segment_options(10, 2)).unwrap();
    generator.start().unwrap();

    assert_eq!(generator.next_id().unwrap(), 0);
    generator.shutdown();
}

#[test]
fn segment_shutdown_closes_and_is_idempotent() {
    let generator = SegmentIdGenerator::new(LocalAuthority::default(), "order", 10, 2).unwrap();
    generator.start().unwrap();
    generator.next_id().unwrap();

    generator.shutdown();
    generator.shutdown();
    assert_eq!(generator.state(), LifecycleState::Shutdown);
    assert!(matches!(generator.next_id(), Err(Error::Closed)));
    assert!(matches!(generator.start(), Err(Error::Closed)));
}

#[test]
fn segment_shutdown_interrupts_retry_backoff() {
    let options = SegmentOptions {
        retry_backoff: Duration::from_secs(30),
        ..SegmentOptions::new(10, 2)
    };
    let generator = SegmentIdGenerator::with_options(DownAuthority, "order", options).unwrap();
    generator.start().unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    generator.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn snowflake_rejects_bad_arguments() {
    assert!(matches!(
        SnowflakeIdGenerator::new(256, small_snowflake_options()),
        Err(Error::InvalidMachineId { machine_id: 256, .. })
    ));
    assert!(matches!(
        SnowflakeIdGenerator::new(1, SnowflakeOptions::new(1, 1, Duration::from_millis(1))),
        Err(Error::InvalidRingSize { size: 1 })
    ));
    assert!(matches!(
        SnowflakeIdGenerator::from_provider(&DownAuthority, "order", small_snowflake_options()),
        Err(Error::Allocation { .. })
    ));
}

#[test]
fn snowflake_requires_start() {
    let generator = SnowflakeIdGenerator::new(1, small_snowflake_options()).unwrap();
    assert_eq!(generator.try_next_id(), None);
    assert!(matches!(generator.next_id(), Err(Error::NotStarted)));
    assert_eq!(generator.next_ids(&mut [0; 4]), 0);
}

#[test]
fn snowflake_start_prefills_the_buffer() {
    let generator = SnowflakeIdGenerator::new(3, small_snowflake_options()).unwrap();
    generator.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || generator.buffered() == generator.capacity()));

    let id = generator.try_next_id().unwrap();
    let (_, machine_id, sequence) = decompose(id);
    assert_eq!(machine_id, 3);
    assert_eq!(sequence, 0);
    generator.shutdown();
}

#[test]
fn snowflake_ids_are_unique_under_a_stalled_clock() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 5_000;

    let clock = MockTime::default();
    clock.millis.store(123 << 14, Ordering::Relaxed);
    let generator =
        SnowflakeIdGenerator::with_clock(9, small_snowflake_options(), clock).unwrap();
    generator.start().unwrap();
    let seen = Mutex::new(HashSet::with_capacity(THREADS * PER_THREAD));

    scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let local: Vec<i64> = (0..PER_THREAD).map(|_| generator.next_id().unwrap()).collect();
                let mut seen = seen.lock().unwrap();
                for id in local {
                    assert_eq!(decompose(id).1, 9);
                    assert!(seen.insert(id), "duplicate id {id}");
                }
            });
        }
    });

    assert_eq!(seen.into_inner().unwrap().len(), THREADS * PER_THREAD);
    generator.shutdown();
}

#[test]
fn snowflake_ids_are_unique_when_the_clock_goes_backwards() {
    let clock = MockTime::default();
    clock.millis.store(500 << 14, Ordering::Relaxed);
    let generator =
        SnowflakeIdGenerator::with_clock(1, small_snowflake_options(), clock.clone()).unwrap();
    generator.start().unwrap();

    let mut seen = HashSet::new();
    for round in 0..4_u64 {
        clock.millis.store((500 - round * 10) << 14, Ordering::Relaxed);
        for _ in 0..4_096 {
            let id = generator.next_id().unwrap();
            assert!(decompose(id).0 >= 500);
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }
    generator.shutdown();
}

#[test]
fn snowflake_bulk_drain() {
    let generator = SnowflakeIdGenerator::new(2, small_snowflake_options()).unwrap();
    generator.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || generator.buffered() >= 100));

    let mut out = [0; 100];
    assert_eq!(generator.next_ids(&mut out), 100);
    assert!(out.windows(2).all(|w| w[0] < w[1]));
    generator.shutdown();
}

#[test]
fn snowflake_blocking_wait_honours_cancellation() {
    let generator = SnowflakeIdGenerator::new(2, small_snowflake_options()).unwrap();
    generator.start().unwrap();

    let cancel = CancellationToken::new();
    assert!(generator.next_id_blocking(&cancel).is_ok());

    let waiter = cancel.clone();
    std::thread::spawn(move || waiter.cancel()).join().unwrap();
    assert!(matches!(
        generator.next_id_blocking(&cancel),
        Err(Error::Cancelled)
    ));
    generator.shutdown();
}

#[test]
fn snowflake_shutdown_closes() {
    let generator = SnowflakeIdGenerator::new(4, small_snowflake_options()).unwrap();
    generator.start().unwrap();
    generator.next_id().unwrap();

    let started = Instant::now();
    generator.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(generator.state(), LifecycleState::Shutdown);
    assert!(matches!(generator.next_id(), Err(Error::Closed)));
    assert!(matches!(
        generator.next_id_blocking(&CancellationToken::new()),
        Err(Error::Closed)
    ));
    assert_eq!(generator.try_next_id(), None);
}

#[test]
fn id_generator_from_config_picks_the_strategy() {
    let authority = Arc::new(LocalAuthority {
        machine_id: 17,
        ..LocalAuthority::default()
    });

    let mut config = GeneratorConfig::default();
    config.segment.biz_tag = "order".into();
    config.segment.step = 50;
    config.kind = GeneratorKind::Segment;

    let segment = IdGenerator::from_config(&config, Arc::clone(&authority)).unwrap();
    assert_eq!(segment.kind(), GeneratorKind::Segment);
    assert!(matches!(segment.next_id(), Err(Error::NotStarted)));
    segment.start().unwrap();
    assert_eq!(segment.next_id().unwrap(), 0);
    segment.shutdown();
    assert_eq!(segment.state(), LifecycleState::Shutdown);

    config.kind = GeneratorKind::Snowflake;
    config.snowflake.biz_tag = "order".into();
    config.snowflake.buffer_size = 1 << 10;
    config.snowflake.fill_batch_size = 128;
    let snowflake = IdGenerator::from_config(&config, authority).unwrap();
    assert_eq!(snowflake.kind(), GeneratorKind::Snowflake);
    snowflake.start().unwrap();
    assert_eq!(decompose(snowflake.next_id().unwrap()).1, 17);
    snowflake.shutdown();
    assert!(matches!(snowflake.next_id(), Err(Error::Closed)));
}

#[test]
fn id_generator_from_config_validates() {
    let config = GeneratorConfig::default();
    assert!(matches!(
        IdGenerator::from_config(&config, Arc::new(LocalAuthority::default())),
        Err(Error::InvalidConfig { .. })
    ));
}
