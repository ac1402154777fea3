#![doc = include_str!("../README.md")]

#[cfg(feature = "client")]
mod client;
mod dto;
mod error;

#[cfg(feature = "client")]
pub use client::*;
pub use dto::*;
pub use error::*;
// Public re-export so downstream crates can reach `ginkgo_id` via
// `ginkgo_id_meta_core::ginkgo_id`
pub use ginkgo_id;
