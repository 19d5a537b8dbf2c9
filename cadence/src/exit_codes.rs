//! Stable exit codes for cadence CLI commands.

/// Command succeeded (or `next` found an eligible task).
pub const OK: i32 = 0;
/// Invalid layout/config/input, or any error without a more specific code.
pub const INVALID: i32 = 1;
/// `cadence next` found no remaining work (project complete).
pub const COMPLETE: i32 = 2;
/// `cadence next` found work remaining but no eligible task.
pub const BLOCKED: i32 = 3;
/// Operation rejected: integrity violation, unmet dependencies, unknown id.
pub const REJECTED: i32 = 4;
/// Storage or snapshot failure; restore the latest snapshot to recover.
pub const STORAGE: i32 = 5;
