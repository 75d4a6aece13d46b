//! Stable exit codes for harness commands.

/// Command completed; per-instance failures are recorded in the report.
pub const OK: i32 = 0;
/// Invalid input (config, dataset, instance ids) or a fatal error.
pub const INVALID: i32 = 1;
