//! Finalization: move job artifacts into dated records under the archive root.
//!
//! Records are created once and never touched again. A failed job keeps its
//! queue entry (and, for iterative jobs, the agent state directory) in place so
//! an operator can inspect and resume it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{JobKind, Outcome, task_stem};
use crate::io::init::ForemanPaths;

/// File written into every direct-prompt record.
pub const STATUS_FILE: &str = "STATUS.md";

/// Where finalization put things.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Record directory, when one was created.
    pub record: Option<PathBuf>,
    /// Archived log files.
    pub logs: Vec<PathBuf>,
    /// Whether the queue entry was removed.
    pub dequeued: bool,
}

/// Second-resolution local timestamp used in archive and log names.
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.with_timezone(&Local).format("%Y%m%d-%H%M%S").to_string()
}

/// `dir/base[.ext]`, or the first free `dir/base-N[.ext]` for N >= 2.
pub fn unique_path(dir: &Path, base: &str, ext: Option<&str>) -> PathBuf {
    let build = |suffix: Option<u32>| {
        let mut name = base.to_string();
        if let Some(n) = suffix {
            name.push_str(&format!("-{n}"));
        }
        if let Some(ext) = ext {
            name.push('.');
            name.push_str(ext);
        }
        dir.join(name)
    };
    let first = build(None);
    if !occupied(&first) {
        return first;
    }
    let mut n = 2;
    loop {
        let candidate = build(Some(n));
        if !occupied(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn occupied(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Rename `from` to `to`, copying and then removing the source when the two
/// sit on different filesystems.
fn move_path(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::CrossesDevices => {
            debug!(from = %from.display(), to = %to.display(), "cross-device move, copying");
            move_by_copy(from, to)?;
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("move {} -> {}", from.display(), to.display()));
        }
    }
    info!(from = %from.display(), to = %to.display(), "archived");
    Ok(())
}

fn move_by_copy(from: &Path, to: &Path) -> Result<()> {
    copy_tree(from, to)
        .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
    let meta = fs::symlink_metadata(from).with_context(|| format!("stat {}", from.display()))?;
    if meta.is_dir() {
        fs::remove_dir_all(from).with_context(|| format!("remove {}", from.display()))?;
    } else {
        fs::remove_file(from).with_context(|| format!("remove {}", from.display()))?;
    }
    Ok(())
}

/// Copy a file, symlink or directory tree. Symlinks are recreated, not followed.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).with_context(|| format!("stat {}", src.display()))?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src).with_context(|| format!("read link {}", src.display()))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("link {}", dst.display()))?;
        #[cfg(not(unix))]
        fs::copy(src, dst).with_context(|| format!("copy {} ({})", src.display(), target.display()))?;
    } else if meta.is_dir() {
        fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
        for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
            let entry = entry.context("read entry")?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst).with_context(|| format!("copy {}", src.display()))?;
    }
    Ok(())
}

/// Move `file` into `dir`, keeping its name unless taken.
fn move_into(file: &Path, dir: &Path) -> Result<PathBuf> {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = file.extension().map(|e| e.to_string_lossy().into_owned());
    let target = unique_path(dir, &stem, ext.as_deref());
    move_path(file, &target)?;
    Ok(target)
}

fn move_logs(logs: &[PathBuf], dir: &Path) -> Result<Vec<PathBuf>> {
    let mut moved = Vec::new();
    for log in logs {
        if !log.is_file() {
            continue;
        }
        moved.push(move_into(log, dir)?);
    }
    Ok(moved)
}

/// Drop a finished task from the queue: symlinks are unlinked, regular files are
/// moved into `record` so their content survives.
fn remove_queue_entry(entry: &Path, record: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(entry) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(task = %entry.display(), "queue entry already gone");
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("stat {}", entry.display())),
    };
    if meta.file_type().is_symlink() {
        fs::remove_file(entry).with_context(|| format!("unlink {}", entry.display()))?;
        info!(task = %entry.display(), "removed queue link");
    } else {
        move_into(entry, record)?;
    }
    Ok(())
}

fn record_dir(paths: &ForemanPaths, task: &Path, kind: JobKind, now: DateTime<Utc>) -> PathBuf {
    let name = task
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = format!(
        "{}-{}-{}",
        task_stem(&name),
        kind.archive_label(),
        timestamp(now)
    );
    unique_path(&paths.archive_dir, &base, None)
}

/// Finalize an iterative job.
///
/// Success: the agent state directory becomes the record and the queue entry is
/// removed. Both outcomes move `logs` into the archive root.
#[instrument(skip_all, fields(task = %task.display(), success = outcome.is_success()))]
pub fn finalize_iterative(
    paths: &ForemanPaths,
    task: &Path,
    outcome: Outcome,
    logs: &[PathBuf],
    now: DateTime<Utc>,
) -> Result<ArchiveReport> {
    fs::create_dir_all(&paths.archive_dir)
        .with_context(|| format!("create directory {}", paths.archive_dir.display()))?;
    let mut report = ArchiveReport::default();

    if outcome.is_success() {
        let record = record_dir(paths, task, JobKind::Iterative, now);
        if paths.agent_state_dir.is_dir() {
            move_path(&paths.agent_state_dir, &record)?;
        } else {
            warn!(
                dir = %paths.agent_state_dir.display(),
                "agent state directory missing at finalization"
            );
            fs::create_dir_all(&record)
                .with_context(|| format!("create directory {}", record.display()))?;
        }
        remove_queue_entry(task, &record)?;
        report.record = Some(record);
        report.dequeued = true;
    }

    report.logs = move_logs(logs, &paths.archive_dir)?;
    Ok(report)
}

/// Summary written to `STATUS.md` of a direct-prompt record.
#[derive(Debug, Clone)]
pub struct PromptSummary {
    pub outcome: Outcome,
    /// Passes that ran to exit.
    pub passes_run: u32,
    pub total_passes: u32,
}

fn render_status(task: &Path, summary: &PromptSummary, now: DateTime<Utc>) -> String {
    let headline = if summary.outcome.is_success() {
        "COMPLETE"
    } else {
        "INCOMPLETE"
    };
    let outcome = match summary.outcome {
        Outcome::Success => "success".to_string(),
        Outcome::Failure(reason) => format!("failure ({reason})"),
    };
    format!(
        "{headline}\n\n- task: {}\n- outcome: {outcome}\n- passes: {}/{}\n- finished: {}\n",
        task.display(),
        summary.passes_run,
        summary.total_passes,
        now.with_timezone(&Local).to_rfc3339(),
    )
}

/// Finalize a direct-prompt job: a record with `STATUS.md`, the pass logs and
/// the implementation notes. Success also removes the queue entry.
#[instrument(skip_all, fields(task = %task.display(), success = summary.outcome.is_success()))]
pub fn finalize_prompt(
    paths: &ForemanPaths,
    task: &Path,
    summary: &PromptSummary,
    artifacts: &[PathBuf],
    now: DateTime<Utc>,
) -> Result<ArchiveReport> {
    let record = record_dir(paths, task, JobKind::DirectPrompt, now);
    fs::create_dir_all(&record)
        .with_context(|| format!("create directory {}", record.display()))?;
    let status_path = record.join(STATUS_FILE);
    fs::write(&status_path, render_status(task, summary, now))
        .with_context(|| format!("write {}", status_path.display()))?;

    let logs = move_logs(artifacts, &record)?;
    let dequeued = summary.outcome.is_success();
    if dequeued {
        remove_queue_entry(task, &record)?;
    }
    Ok(ArchiveReport {
        record: Some(record),
        logs,
        dequeued,
    })
}

/// Move leftover agent state from an unexpected earlier run aside.
///
/// Returns the backup location when something was moved.
pub fn backup_stale_agent_state(
    paths: &ForemanPaths,
    now: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    if !paths.agent_state_dir.exists() {
        return Ok(None);
    }
    fs::create_dir_all(&paths.archive_dir)
        .with_context(|| format!("create directory {}", paths.archive_dir.display()))?;
    let label = paths
        .agent_state_dir
        .file_name()
        .map(|n| n.to_string_lossy().trim_start_matches('.').to_string())
        .unwrap_or_default();
    let target = unique_path(
        &paths.archive_dir,
        &format!("stale-{label}-{}", timestamp(now)),
        None,
    );
    warn!(
        from = %paths.agent_state_dir.display(),
        to = %target.display(),
        "moving stale agent state aside"
    );
    move_path(&paths.agent_state_dir, &target)?;
    Ok(Some(target))
}

/// Move the logs of an abandoned direct-prompt run into a `stale-` record so a
/// rerun starts with fresh transcripts.
#[instrument(skip_all, fields(task = %task.display(), artifacts = artifacts.len()))]
pub fn set_aside_prompt_artifacts(
    paths: &ForemanPaths,
    task: &Path,
    artifacts: &[PathBuf],
    now: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    if !artifacts.iter().any(|path| path.is_file()) {
        return Ok(None);
    }
    let name = task
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = unique_path(
        &paths.archive_dir,
        &format!(
            "stale-{}-{}-{}",
            task_stem(&name),
            JobKind::DirectPrompt.archive_label(),
            timestamp(now)
        ),
        None,
    );
    fs::create_dir_all(&target).with_context(|| format!("create directory {}", target.display()))?;
    move_logs(artifacts, &target)?;
    warn!(to = %target.display(), "moved logs of interrupted run aside");
    Ok(Some(target))
}
