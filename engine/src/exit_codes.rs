//! Stable exit codes for engine CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, request JSON, or command text; or any other failure.
pub const INVALID: i32 = 1;
/// `engine exec` produced a response with `isError: true`.
pub const TOOL_ERROR: i32 = 2;
