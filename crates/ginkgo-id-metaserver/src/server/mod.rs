pub mod allocator;
pub mod config;
pub mod service;
pub mod telemetry;
