//! Deterministic classification and ordering of queue entries.
//!
//! Queue entry names encode both the job kind and, for iterative jobs, the
//! priority number. Ordering is total: iterative jobs first by ascending
//! priority, then direct-prompt jobs oldest first, ties broken by name.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{JobKind, QueueKey, TaskDescriptor};

static ITERATIVE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^prd-(\d+)-.+\.md$").expect("valid regex"));
static DIRECT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:todo|plan)-.+?(?:\.p(\d+))?\.md$").expect("valid regex"));

/// Kind and naming metadata parsed from a queue entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameClass {
    Iterative { priority: u64 },
    DirectPrompt { passes: u32 },
}

impl NameClass {
    pub fn kind(self) -> JobKind {
        match self {
            NameClass::Iterative { .. } => JobKind::Iterative,
            NameClass::DirectPrompt { .. } => JobKind::DirectPrompt,
        }
    }
}

/// Classify a queue entry by file name. Returns `None` for names that are not tasks.
///
/// A `.p<N>.md` suffix declares `N` passes for direct-prompt jobs; `N` below 1
/// is clamped to 1.
pub fn classify_name(name: &str) -> Option<NameClass> {
    if let Some(caps) = ITERATIVE_NAME.captures(name) {
        let priority = caps[1].parse::<u64>().ok()?;
        return Some(NameClass::Iterative { priority });
    }
    if let Some(caps) = DIRECT_NAME.captures(name) {
        let passes = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(1)
            .max(1);
        return Some(NameClass::DirectPrompt { passes });
    }
    None
}

/// Compare two descriptors according to queue order.
pub fn queue_order(a: &TaskDescriptor, b: &TaskDescriptor) -> Ordering {
    kind_rank(a.kind)
        .cmp(&kind_rank(b.kind))
        .then_with(|| compare_keys(a.key, b.key))
        .then_with(|| a.name().cmp(&b.name()))
}

/// Sort descriptors in place into queue order.
pub fn sort_queue(tasks: &mut [TaskDescriptor]) {
    tasks.sort_by(queue_order);
}

fn kind_rank(kind: JobKind) -> u8 {
    match kind {
        JobKind::Iterative => 0,
        JobKind::DirectPrompt => 1,
    }
}

fn compare_keys(a: QueueKey, b: QueueKey) -> Ordering {
    match (a, b) {
        (QueueKey::Priority(x), QueueKey::Priority(y)) => x.cmp(&y),
        (QueueKey::Modified(x), QueueKey::Modified(y)) => x.cmp(&y),
        (QueueKey::Priority(_), QueueKey::Modified(_)) => Ordering::Less,
        (QueueKey::Modified(_), QueueKey::Priority(_)) => Ordering::Greater,
    }
}
