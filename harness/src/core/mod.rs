//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod identity;
pub mod patch;
pub mod report;
pub mod script;
pub mod spec;
pub mod types;
