//! Fixed-capacity ring buffers with a single producer and many consumers.
//!
//! - [`SpmcRing`] buffers heap values (leased [`Segment`](crate::Segment)s)
//!   and supports compare-and-pop of the head.
//! - [`WatermarkRing`] buffers plain ids and wakes its producer when the fill
//!   level drops to a watermark.

mod spmc;
mod watermark;

pub use spmc::*;
pub use watermark::*;
