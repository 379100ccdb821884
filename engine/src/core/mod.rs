//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod catalog;
pub mod decisions;
pub mod frameworks;
pub mod gates;
pub mod parser;
pub mod review;
pub mod scripts;
pub mod session;
pub mod types;
pub mod verify;
