//! Prompt execution engine.
//!
//! Turns symbolic commands (`>>analyze --> >>summarize :: 'cite sources'`)
//! into rendered prompt steps, tracks multi-step chains across invocations,
//! and enforces quality gates and shell verification loops. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (parsing, gate accumulation,
//!   decisions, review and verification transitions). No I/O, fully testable
//!   in isolation.
//! - **[`io`]**: Side-effecting operations (config, prompt files, session
//!   files, subprocesses, git). Isolated behind traits to enable mocking.
//!
//! Orchestration modules ([`pipeline`], [`chain_session`], [`gate_review`],
//! [`verification`], [`server`]) coordinate core logic with I/O.

pub mod chain_session;
pub mod core;
pub mod exit_codes;
pub mod gate_review;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod server;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verification;
