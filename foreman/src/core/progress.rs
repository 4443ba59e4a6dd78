//! Narrow parser for the iterative agent's status text.
//!
//! The agent's status output is opaque apart from three things: a
//! `Progress: <done>/<total> complete` line, numbered task lines whose first
//! token is a completion mark, and a literal announcing that no loop is active.
//! Everything else is ignored so the format can drift without touching the
//! supervisor.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Progress;

/// Literal the status command prints when no loop is running.
pub const NO_ACTIVE_LOOP: &str = "No active loop";

/// Mark used on numbered task lines that are complete.
pub const DONE_MARK: &str = "\u{2705}";

static PROGRESS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Progress:\s*(\d+)/(\d+)\s*complete").expect("valid regex"));
static TASK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s+\d+\.\s+(\S+)").expect("valid regex"));

/// Parse completion counts from status text.
///
/// Primary source is the `Progress:` line; otherwise counts numbered task lines
/// and how many of them start with [`DONE_MARK`].
pub fn parse_progress(status: &str) -> Progress {
    if let Some(caps) = PROGRESS_LINE.captures(status)
        && let (Ok(done), Ok(total)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>())
    {
        return Progress::Known { done, total };
    }

    let marks: Vec<&str> = TASK_LINE
        .captures_iter(status)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if marks.is_empty() {
        return Progress::Unknown;
    }
    let total = marks.len() as u32;
    let done = marks.iter().filter(|m| m.starts_with(DONE_MARK)).count() as u32;
    Progress::Known { done, total }
}

/// True if the status text says no loop is active.
pub fn is_no_active_loop(status: &str) -> bool {
    status.contains(NO_ACTIVE_LOOP)
}

/// True if the status text reports every task complete.
pub fn is_all_complete(status: &str) -> bool {
    parse_progress(status).is_complete()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_line() {
        let status = "Loop: active\nProgress: 4/6 complete\n";
        assert_eq!(parse_progress(status), Progress::Known { done: 4, total: 6 });
        assert!(!is_all_complete(status));
    }

    #[test]
    fn progress_line_wins_over_task_lines() {
        let status = "Progress: 2/2 complete\n   1. \u{2705} US-1\n   2. \u{23f3} US-2\n";
        assert_eq!(parse_progress(status), Progress::Known { done: 2, total: 2 });
        assert!(is_all_complete(status));
    }

    #[test]
    fn falls_back_to_numbered_task_lines() {
        let status = "Tasks:\n   1. \u{2705} US-1 login\n   2. \u{2705} US-2 logout\n   3. \u{23f3} US-3 reset\n";
        assert_eq!(parse_progress(status), Progress::Known { done: 2, total: 3 });
    }

    #[test]
    fn unknown_when_nothing_matches() {
        assert_eq!(parse_progress(""), Progress::Unknown);
        assert_eq!(parse_progress("error: state missing"), Progress::Unknown);
        assert!(!is_all_complete(""));
    }

    #[test]
    fn zero_total_is_not_complete() {
        assert!(!is_all_complete("Progress: 0/0 complete"));
    }

    #[test]
    fn detects_no_active_loop() {
        assert!(is_no_active_loop("No active loop found.\nProgress: 1/3 complete"));
        assert!(!is_no_active_loop("Loop running (iteration 2)"));
    }
}
