//! Stable exit codes for forge CLI commands.

/// Command succeeded; for `run`, the task succeeded or was handed off.
pub const OK: i32 = 0;
/// Invalid input, config, or an unexpected failure outside the driver.
pub const INVALID: i32 = 1;
/// `forge run` exhausted its iterations or was aborted.
pub const ESCALATED: i32 = 2;
/// `forge run` stopped at intake with clarifying questions.
pub const NEEDS_CLARIFICATION: i32 = 3;
