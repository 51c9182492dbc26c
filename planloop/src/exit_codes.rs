//! Stable exit codes for planloop CLI commands.

/// Command succeeded, or the run completed every phase.
pub const OK: i32 = 0;
/// Invalid plan, workflow, template or config, or any other error.
pub const INVALID: i32 = 1;
/// A required step failed or the iteration cap was reached.
pub const FAILED: i32 = 2;
/// The run was stopped by the user.
pub const STOPPED: i32 = 3;
