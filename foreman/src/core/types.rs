//! Shared deterministic types for foreman core logic.
//!
//! These types define stable contracts between the scanner, the agent driver and
//! the supervisor. They carry no I/O handles and serialize deterministically.

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a queued task is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// `prd-<n>-*.md`: driven by an agent with its own internal loop.
    Iterative,
    /// `todo-*.md` / `plan-*.md`: one single-shot agent call per pass.
    DirectPrompt,
}

impl JobKind {
    /// Label used in archive record names.
    pub fn archive_label(self) -> &'static str {
        match self {
            JobKind::Iterative => "ralph",
            JobKind::DirectPrompt => "prompt",
        }
    }
}

/// Ordering key derived from the queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKey {
    /// Numeric priority from the `prd-<n>-` prefix.
    Priority(u64),
    /// Modification time of the resolved entry (oldest first).
    Modified(SystemTime),
}

/// One queued unit of work discovered in the queue directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub path: PathBuf,
    pub kind: JobKind,
    pub key: QueueKey,
    /// Total passes for direct-prompt jobs (always 1 for iterative jobs).
    pub passes: u32,
}

impl TaskDescriptor {
    /// File name of the queue entry.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Strip a trailing `.md` from a queue entry name.
pub fn task_stem(name: &str) -> String {
    name.strip_suffix(".md").unwrap_or(name).to_string()
}

/// Completion counts reported by the iterative agent's status command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Known { done: u32, total: u32 },
    Unknown,
}

impl Progress {
    /// True only when progress is known, non-empty and fully done.
    pub fn is_complete(self) -> bool {
        matches!(self, Progress::Known { done, total } if total > 0 && done == total)
    }
}

/// Rate-limit notice seen in agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHit {
    /// Parsed reset instant; `None` when the time or zone could not be parsed.
    pub reset_at: Option<DateTime<Utc>>,
}

/// How an agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    /// Nonzero exit; `None` when terminated by a signal or never spawned.
    Failure(Option<i32>),
}

impl ExitCode {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitCode::Success,
            other => ExitCode::Failure(other),
        }
    }
}

/// Final verdict for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Work-incomplete ceiling reached.
    MaxRetriesReached,
    /// Agent-error ceiling reached.
    Errored,
    /// The agent stopped out-of-band with incomplete progress (found at reconcile or
    /// while monitoring a resumed job).
    StoppedIncomplete,
    /// Final direct-prompt pass exited without the completion marker.
    MarkerMissing,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::MaxRetriesReached => "max retries reached",
            FailureReason::Errored => "errored",
            FailureReason::StoppedIncomplete => "agent stopped with incomplete progress",
            FailureReason::MarkerMissing => "completion marker missing",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_complete_requires_nonzero_total() {
        assert!(Progress::Known { done: 3, total: 3 }.is_complete());
        assert!(!Progress::Known { done: 0, total: 0 }.is_complete());
        assert!(!Progress::Known { done: 2, total: 3 }.is_complete());
        assert!(!Progress::Unknown.is_complete());
    }

    #[test]
    fn exit_code_maps_signal_to_failure() {
        assert_eq!(ExitCode::from_code(Some(0)), ExitCode::Success);
        assert_eq!(ExitCode::from_code(Some(2)), ExitCode::Failure(Some(2)));
        assert_eq!(ExitCode::from_code(None), ExitCode::Failure(None));
    }

    #[test]
    fn task_stem_strips_md_suffix() {
        assert_eq!(task_stem("prd-07-auth.md"), "prd-07-auth");
        assert_eq!(task_stem("notes.txt"), "notes.txt");
    }
}
