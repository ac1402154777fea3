//! HTTP surface of the allocation authority.
//!
//! ## Structure
//!
//! - [`handler`] - the shared service state (`MetaService`), the axum router
//!   and the request handlers.

pub mod handler;
