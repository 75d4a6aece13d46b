//! Container-based patch evaluation harness.
//!
//! For each task instance the harness builds (or fetches) a container image
//! for the instance's environment, applies patches inside a fresh container,
//! runs the test command, and reads back a structured test report. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (spec identity, script rendering,
//!   report reconciliation, differential classification). No I/O.
//! - **[`io`]**: Side-effecting adapters (container runtime, registry, git,
//!   config, datasets, log files). Behind traits where tests need fakes.
//!
//! Orchestration modules ([`image`], [`instance`], [`scheduler`], [`produce`],
//! [`evaluate`]) combine the two to implement the CLI and server commands.

pub mod cancel;
pub mod core;
pub mod error;
pub mod evaluate;
pub mod exit_codes;
pub mod image;
pub mod instance;
pub mod io;
pub mod logging;
pub mod produce;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
