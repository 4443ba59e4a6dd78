//! Crash-recovery record for the single in-flight job (`.foreman/state.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::policy::RetryCounters;
use crate::core::types::JobKind;

/// Persisted bookkeeping for the active job.
///
/// Written after every transition; an empty `active_task` means idle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobState {
    /// Queue entry of the job in flight.
    pub active_task: Option<PathBuf>,
    /// Kind of the job in flight.
    pub kind: Option<JobKind>,
    /// Clean exits with unfinished work so far.
    pub retry_count: u32,
    /// Nonzero exits so far.
    pub error_retry_count: u32,
    /// Current pass (1-based; 0 when idle).
    pub pass_index: u32,
    /// Total passes of the job in flight.
    pub total_passes: u32,
    /// Iterative agent's stream log, archived at finalization.
    pub agent_log: Option<PathBuf>,
    /// Rate-limit wait in progress; the same attempt reruns at this instant.
    pub resume_at: Option<DateTime<Utc>>,
    /// Queue entry names finalized as failures; skipped until they leave the queue.
    pub held: Vec<String>,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        self.active_task.is_some()
    }

    pub fn counters(&self) -> RetryCounters {
        RetryCounters {
            retry_count: self.retry_count,
            error_retry_count: self.error_retry_count,
        }
    }

    pub fn set_counters(&mut self, counters: RetryCounters) {
        self.retry_count = counters.retry_count;
        self.error_retry_count = counters.error_retry_count;
    }

    /// Mark `task` active at pass 1 with fresh counters.
    pub fn activate(&mut self, task: PathBuf, kind: JobKind, total_passes: u32) {
        self.active_task = Some(task);
        self.kind = Some(kind);
        self.retry_count = 0;
        self.error_retry_count = 0;
        self.pass_index = 1;
        self.total_passes = total_passes;
        self.agent_log = None;
        self.resume_at = None;
    }

    /// Return to idle, keeping the held list.
    pub fn clear_active(&mut self) {
        *self = JobState {
            held: std::mem::take(&mut self.held),
            ..JobState::default()
        };
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.iter().any(|held| held == name)
    }

    pub fn hold(&mut self, name: &str) {
        if !self.is_held(name) {
            self.held.push(name.to_string());
            self.held.sort();
        }
    }

    /// Drop held names no longer present in the queue. Returns true if anything changed.
    pub fn release_missing(&mut self, present: &[String]) -> bool {
        let before = self.held.len();
        self.held.retain(|name| present.contains(name));
        self.held.len() != before
    }
}

/// Load the job state; a missing, empty or corrupt file yields the idle default.
pub fn load_job_state(path: &Path) -> JobState {
    debug!(path = %path.display(), "loading job state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return JobState::default(),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable job state, treating as idle");
            return JobState::default();
        }
    };
    if contents.trim().is_empty() {
        return JobState::default();
    }
    match serde_json::from_str::<JobState>(&contents) {
        Ok(state) => {
            debug!(active_task = ?state.active_task, pass = state.pass_index, "job state loaded");
            state
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "corrupt job state, treating as idle");
            JobState::default()
        }
    }
}

/// Atomically write job state to disk (temp file + rename).
pub fn write_job_state(path: &Path, state: &JobState) -> Result<()> {
    debug!(
        path = %path.display(),
        active_task = ?state.active_task,
        pass = state.pass_index,
        retry_count = state.retry_count,
        error_retry_count = state.error_retry_count,
        "writing job state"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("job state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp job state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace job state {}", path.display()))?;
    Ok(())
}
