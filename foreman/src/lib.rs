//! Single-job supervisor for autonomous coding agents.
//!
//! Foreman watches a queue directory of task files, runs exactly one task at a
//! time through an external agent, and archives the result. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task classification, status and
//!   rate-limit parsing, pass instructions, retry policy). No I/O.
//! - **[`io`]**: Side-effecting adapters (filesystem, agent processes, clock).
//!   Behind traits where the supervisor needs test doubles.
//!
//! [`supervisor`] composes both into the job state machine that `foreman run`
//! drives.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
