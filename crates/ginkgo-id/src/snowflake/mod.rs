//! Snowflake-style ids: a batch bit-packer and the producer thread that keeps
//! a [`WatermarkRing`](crate::WatermarkRing) stocked with its output.

mod layout;
mod producer;

pub use layout::*;
pub(crate) use producer::Producer;
