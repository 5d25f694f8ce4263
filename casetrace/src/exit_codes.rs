//! Stable exit codes for sessions and `casetrace` CLI commands.

/// All items passed, or the command succeeded.
pub const OK: i32 = 0;
/// At least one item failed, or the session was exited by `STOP_EXIT_SESSION`.
pub const TESTS_FAILED: i32 = 1;
/// The session was exited by `FAIL_EXIT_SESSION`.
pub const INTERRUPTED: i32 = 2;
/// A remote call or other internal error stopped the session.
pub const INTERNAL_ERROR: i32 = 3;
/// Invalid configuration or command-line usage.
pub const USAGE_ERROR: i32 = 4;
/// No items were collected.
pub const NO_TESTS: i32 = 5;
