//! High-throughput 64-bit id generators.
//!
//! - [`SegmentIdGenerator`] hands out ids from contiguous ranges leased ahead
//!   of time from an allocation authority.
//! - [`SnowflakeIdGenerator`] serves `timestamp | machine id | sequence` ids
//!   pre-generated by a background producer.
//!
//! Both feed any number of consumer threads from a lock-free ring that a
//! single background thread keeps stocked. [`IdGenerator`] picks one at
//! runtime from a [`GeneratorConfig`].

mod config;
mod error;
mod generator;
mod mutex;
mod ring;
mod segment;
#[cfg(feature = "serde")]
mod serde;
mod snowflake;
mod time;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::generator::*;
pub use crate::ring::*;
pub use crate::segment::*;
#[cfg(feature = "serde")]
pub use crate::serde::*;
pub use crate::snowflake::*;
pub use crate::time::*;
