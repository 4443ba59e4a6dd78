//! Deterministic, pure logic shared by the supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on strings and
//! in-memory values and return deterministic outputs suitable for tests.

pub mod policy;
pub mod progress;
pub mod prompt;
pub mod queue;
pub mod rate_limit;
pub mod types;
