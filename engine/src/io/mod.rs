//! Side-effecting collaborators: files, subprocesses and git.

pub mod config;
pub mod git;
pub mod isolation;
pub mod process;
pub mod prompts;
pub mod scripts;
pub mod session_store;
pub mod shell;
pub mod template;
pub mod verify_state;
