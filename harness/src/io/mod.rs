//! I/O adapters for the harness.

pub mod config;
pub mod context;
pub mod dataset;
pub mod log_sink;
pub mod process;
pub mod registry;
pub mod repo;
pub mod runtime;
