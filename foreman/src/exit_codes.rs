//! Stable exit codes for foreman CLI commands.

/// Normal shutdown, or help/version display.
pub const OK: i32 = 0;
/// Missing queue/archive directories, unreachable or unsupported agent, bad config, or other errors.
pub const INVALID: i32 = 1;
