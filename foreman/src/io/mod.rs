//! I/O adapters for the supervisor.

pub mod agent;
pub mod archive;
pub mod clock;
pub mod config;
pub mod init;
pub mod job_state;
pub mod process;
pub mod scanner;
pub mod sidecar;
