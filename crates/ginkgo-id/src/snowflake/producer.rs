use std::sync::Arc;
use std::time::Duration;

use crate::generator::StopSignal;
use crate::{BatchSnowflake, TimeSource, WatermarkRing};

/// Initial idle park, before doubling.
const INITIAL_IDLE: Duration = Duration::from_millis(10);

/// Body of the `snowflake-producer` thread.
///
/// Owns the bit-packer exclusively. While the ring is above its watermark the
/// producer parks with an exponentially growing timeout (capped at
/// `max_idle`); a watermark crossing unparks it immediately and it refills
/// the ring to capacity in batches.
pub(crate) struct Producer<T> {
    ring: Arc<WatermarkRing>,
    generator: BatchSnowflake<T>,
    batch: Vec<i64>,
    initial_idle: Duration,
    max_idle: Duration,
}

impl<T: TimeSource> Producer<T> {
    pub(crate) fn new(
        ring: Arc<WatermarkRing>,
        generator: BatchSnowflake<T>,
        fill_batch_size: usize,
        max_idle: Duration,
    ) -> Self {
        Self {
            ring,
            generator,
            batch: vec![0; fill_batch_size.max(1)],
            initial_idle: INITIAL_IDLE.min(max_idle),
            max_idle,
        }
    }

    pub(crate) fn run(mut self, stop: &StopSignal) {
        #[cfg(feature = "tracing")]
        tracing::debug!(machine_id = self.generator.machine_id(), "snowflake producer running");

        while !stop.is_stopped() {
            if self.ring.needs_filling() {
                self.fill(stop);
            } else {
                self.idle_wait(stop);
            }
        }
    }

    /// Tops the ring up to capacity.
    fn fill(&mut self, stop: &StopSignal) {
        self.ring.mark_fill_start();
        while !stop.is_stopped() {
            let count = self.ring.free().min(self.batch.len());
            if count == 0 {
                break;
            }
            let batch = &mut self.batch[..count];
            self.generator.generate_batch(batch);
            // Single producer: free space can only have grown since `free()`.
            let accepted = self.ring.batch_offer(batch);
            debug_assert_eq!(accepted, count);
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(buffered = self.ring.len(), tick = self.generator.last_tick(), "fill complete");
        self.ring.mark_fill_complete();
    }

    fn idle_wait(&self, stop: &StopSignal) {
        let mut wait = self.initial_idle;
        while !self.ring.needs_filling() {
            if stop.park_timeout(wait) {
                return;
            }
            wait = (wait * 2).min(self.max_idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemClock;
    use crate::generator::BackgroundWorker;
    use std::time::Instant;

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
    fn initial_idle_is_capped_by_max_idle() {
        let ring = Arc::new(WatermarkRing::new(8).unwrap());
        let generator = BatchSnowflake::with_clock(1, SystemClock::default()).unwrap();
        let producer = Producer::new(ring, generator, 4, Duration::from_millis(3));
        assert_eq!(producer.initial_idle, Duration::from_millis(3));
        assert_eq!(producer.batch.len(), 4);
    }

    #[test]
    fn fills_to_capacity_and_refills_after_watermark() {
        let ring = Arc::new(WatermarkRing::new(64).unwrap());
        let generator = BatchSnowflake::new(2).unwrap();
        let producer = Producer::new(Arc::clone(&ring), generator, 10, Duration::from_secs(5));

        let mut worker =
            BackgroundWorker::spawn("snowflake-producer", move |stop| producer.run(&stop)).unwrap();
        ring.register_producer(worker.thread().clone());

        assert!(wait_until(Duration::from_secs(2), || ring.len() == 64));

        // drain below the watermark; the producer must be woken well before
        // its 5s idle timeout
        let mut out = [0; 32];
        assert_eq!(ring.batch_poll(&mut out), 32);
        assert!(wait_until(Duration::from_secs(2), || ring.len() == 64));

        assert!(worker.shutdown(Duration::from_secs(2)));
    }
}
