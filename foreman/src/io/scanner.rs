//! Queue directory scan.
//!
//! Recomputed from scratch on every call: the directory is owned by other tools
//! and may change between ticks.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, trace};

use crate::core::queue::{NameClass, classify_name, sort_queue};
use crate::core::types::{QueueKey, TaskDescriptor};

/// List task descriptors in `queue_dir` in queue order.
///
/// Entries that do not resolve (broken symlinks) or whose names match no task
/// pattern are skipped. A missing directory yields an empty queue.
pub fn scan_queue(queue_dir: &Path) -> Result<Vec<TaskDescriptor>> {
    if !queue_dir.exists() {
        return Ok(Vec::new());
    }
    let entries =
        fs::read_dir(queue_dir).with_context(|| format!("read {}", queue_dir.display()))?;

    let mut tasks = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", queue_dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(class) = classify_name(&name) else {
            trace!(name = %name, "ignoring non-task entry");
            continue;
        };
        let path = entry.path();
        // fs::metadata follows symlinks, so broken links fail here.
        let Ok(meta) = fs::metadata(&path) else {
            debug!(name = %name, "skipping unresolvable entry");
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let (key, passes) = match class {
            NameClass::Iterative { priority } => (QueueKey::Priority(priority), 1),
            NameClass::DirectPrompt { passes } => (
                QueueKey::Modified(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
                passes,
            ),
        };
        tasks.push(TaskDescriptor {
            path,
            kind: class.kind(),
            key,
            passes,
        });
    }

    sort_queue(&mut tasks);
    Ok(tasks)
}
