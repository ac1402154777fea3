//! The allocation protocol.
//!
//! Each allocation takes the biz tag's named lock, then runs up to
//! `max_retries` optimistic attempts: read the record, insert it if absent,
//! otherwise conditionally update it from the value just read. A lost race
//! (duplicate insert, zero rows updated) is a retry; running out of attempts
//! is [`Error::AllocationExhausted`].

use chrono::{Local, NaiveDateTime};
use core::time::Duration;
use ginkgo_id_meta_core::{Error, Result, SegmentMetaDto, SnowflakeNodeDto, validate_biz_tag};
use std::time::Instant;

use super::{LockService, RecordStore, SegmentMeta, SnowflakeNode, StoreError};
use crate::server::telemetry::{
    increment_allocation_failures, increment_allocation_retries, increment_machine_ids_allocated,
    increment_segments_allocated, record_allocation_duration,
};

/// Tuning for [`Authority`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorityConfig {
    /// Optimistic attempts per allocation before giving up.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_backoff: Duration,
    /// Step applied when a segment request carries none.
    pub default_step: i64,
}

impl AuthorityConfig {
    pub const DEFAULT_MAX_RETRIES: u32 = 10;
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(5);
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
            default_step: ginkgo_id_meta_core::DEFAULT_STEP,
        }
    }
}

/// A leased range `[next_id, next_id + step - 1]` and the record it came
/// from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentAllocation {
    pub meta: SegmentMeta,
    pub next_id: i64,
    pub step: i64,
}

impl From<SegmentAllocation> for SegmentMetaDto {
    fn from(allocation: SegmentAllocation) -> Self {
        Self {
            id: allocation.meta.id,
            biz_tag: allocation.meta.biz_tag,
            next_id: allocation.next_id,
            step: allocation.step,
            create_time: allocation.meta.create_time,
            update_time: allocation.meta.update_time,
        }
    }
}

impl From<SnowflakeNode> for SnowflakeNodeDto {
    fn from(node: SnowflakeNode) -> Self {
        Self {
            id: node.id,
            biz_tag: node.biz_tag,
            machine_id: node.machine_id,
            create_time: node.create_time,
            update_time: node.update_time,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::internal(err)
    }
}

/// Outcome of one optimistic attempt.
enum Attempt<T> {
    Done(T),
    Retry,
}

/// Hands out machine ids and segments, never the same one twice.
pub struct Authority<S, L> {
    store: S,
    locks: L,
    config: AuthorityConfig,
}

impl<S, L> Authority<S, L>
where
    S: RecordStore,
    L: LockService,
{
    pub fn new(store: S, locks: L, config: AuthorityConfig) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Leases the next machine id for `biz_tag`, starting at 0.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for an empty `biz_tag`
    /// - [`Error::AllocationExhausted`] if every attempt lost a race
    /// - [`Error::Internal`] if the store fails
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn allocate_machine_id(&self, biz_tag: &str) -> Result<SnowflakeNode> {
        validate_biz_tag(biz_tag)?;
        let _guard = self.locks.acquire(&format!("machine_id_lock:{biz_tag}"));

        let node = self.with_retries(biz_tag, || {
            let now = now();
            match self.store.find_node(biz_tag)? {
                None => match self.store.insert_node(biz_tag, 0, now) {
                    Ok(node) => Ok(Attempt::Done(node)),
                    Err(StoreError::Duplicate { .. }) => {
                        tracing::warn!(biz_tag, "duplicate machine id insert, retrying");
                        Ok(Attempt::Retry)
                    }
                    Err(e) => Err(e.into()),
                },
                Some(node) => {
                    let machine_id = node.machine_id + 1;
                    if self.store.update_machine_id(biz_tag, node.machine_id, machine_id, now)? == 0 {
                        return Ok(Attempt::Retry);
                    }
                    Ok(Attempt::Done(SnowflakeNode {
                        machine_id,
                        update_time: now,
                        ..node
                    }))
                }
            }
        })?;

        increment_machine_ids_allocated();
        tracing::info!(biz_tag, machine_id = node.machine_id, "machine id allocated");
        Ok(node)
    }

    /// Leases the next `step` ids for `biz_tag`. `None` uses the configured
    /// default step. The first lease of a tag starts at 0 and leases are
    /// contiguous: with a step of 100 they start at 0, 100, 200 and so on.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for an empty `biz_tag`, a step
    ///   `<= 0`, or a step past the end of the id space
    /// - [`Error::AllocationExhausted`] if every attempt lost a race
    /// - [`Error::Internal`] if the store fails
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn allocate_segment(&self, biz_tag: &str, step: Option<i64>) -> Result<SegmentAllocation> {
        validate_biz_tag(biz_tag)?;
        let step = match step.unwrap_or(self.config.default_step) {
            step if step > 0 => step,
            step => return Err(Error::invalid_request(format!("step must be > 0, got {step}"))),
        };
        let _guard = self.locks.acquire(&format!("segment_meta_lock:{biz_tag}"));

        let allocation = self.with_retries(biz_tag, || {
            let now = now();
            match self.store.find_segment(biz_tag)? {
                // The stored cursor is the first id not yet leased, so a new
                // record already covers `[0, step)`. Storing the last leased
                // end instead would let a later call with a different step
                // overlap this range.
                None => match self.store.insert_segment(biz_tag, step, now) {
                    Ok(meta) => Ok(Attempt::Done(SegmentAllocation {
                        meta,
                        next_id: 0,
                        step,
                    })),
                    Err(StoreError::Duplicate { .. }) => {
                        tracing::warn!(biz_tag, "duplicate segment insert, retrying");
                        Ok(Attempt::Retry)
                    }
                    Err(e) => Err(e.into()),
                },
                Some(meta) => {
                    let next_id = meta.next_id;
                    let Some(cursor) = next_id.checked_add(step) else {
                        return Err(Error::invalid_request(format!(
                            "step {step} overflows the id space of `{biz_tag}` at {next_id}"
                        )));
                    };
                    if self.store.update_next_id(biz_tag, next_id, cursor, now)? == 0 {
                        return Ok(Attempt::Retry);
                    }
                    Ok(Attempt::Done(SegmentAllocation {
                        meta: SegmentMeta {
                            next_id: cursor,
                            update_time: now,
                            ..meta
                        },
                        next_id,
                        step,
                    }))
                }
            }
        })?;

        increment_segments_allocated();
        tracing::info!(biz_tag, next_id = allocation.next_id, step, "segment allocated");
        Ok(allocation)
    }

    fn with_retries<T>(&self, biz_tag: &str, mut attempt: impl FnMut() -> Result<Attempt<T>>) -> Result<T> {
        let start = Instant::now();
        let mut attempts = 0;

        let result = loop {
            if attempts == self.config.max_retries {
                tracing::error!(biz_tag, attempts, "allocation exhausted its retries");
                break Err(Error::AllocationExhausted {
                    biz_tag: biz_tag.to_owned(),
                    attempts,
                });
            }
            attempts += 1;
            match attempt() {
                Ok(Attempt::Done(value)) => break Ok(value),
                Ok(Attempt::Retry) => {
                    increment_allocation_retries();
                    tracing::debug!(biz_tag, attempts, "allocation lost a race");
                    std::thread::sleep(self.config.retry_backoff);
                }
                Err(e) => {
                    tracing::error!(biz_tag, error = %e, "allocation failed");
                    break Err(e);
                }
            }
        };

        record_allocation_duration(start.elapsed().as_secs_f64() * 1_000.0);
        if result.is_err() {
            increment_allocation_failures();
        }
        result
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
