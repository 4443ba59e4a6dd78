//! Instructions for direct-prompt passes.
//!
//! Pass 1 always implements, the last pass of a multi-pass job verifies, and
//! anything in between implements again. Every instruction names the task file
//! and asks for [`COMPLETION_MARKER`] once the pass is finished.

use std::path::Path;

/// Literal an agent must print to signal that a pass is finished.
pub const COMPLETION_MARKER: &str = "FOREMAN_TASK_COMPLETE";

/// What a single pass asks the agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassRole {
    Implement,
    Verify,
}

impl PassRole {
    pub fn label(self) -> &'static str {
        match self {
            PassRole::Implement => "implement",
            PassRole::Verify => "verify",
        }
    }
}

/// Role of pass `pass` (1-based) out of `total` passes.
pub fn pass_role(pass: u32, total: u32) -> PassRole {
    if total > 1 && pass == total {
        PassRole::Verify
    } else {
        PassRole::Implement
    }
}

/// Render the instruction for one pass.
///
/// `notes` is the file implement passes write their summary to and verify passes
/// read from.
pub fn render_instruction(role: PassRole, task: &Path, notes: &Path) -> String {
    let task = task.display();
    let notes = notes.display();
    match role {
        PassRole::Implement => format!(
            "Read the task file at {task} and implement everything it describes. \
             Work until the task is fully done. Append a short summary of what you \
             implemented and which files you changed to {notes}. When you are \
             finished, print the exact line {COMPLETION_MARKER} on its own."
        ),
        PassRole::Verify => format!(
            "Read the task file at {task}, then read {notes}, which describes what \
             was implemented for it. Verify that everything the task asks for is \
             implemented and working, and fix anything missing or broken. When \
             verification is finished, print the exact line {COMPLETION_MARKER} \
             on its own."
        ),
    }
}

/// True if an output line carries the completion marker.
pub fn has_completion_marker(line: &str) -> bool {
    line.contains(COMPLETION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_pass_implements() {
        assert_eq!(pass_role(1, 1), PassRole::Implement);
    }

    #[test]
    fn last_of_many_verifies() {
        assert_eq!(pass_role(1, 2), PassRole::Implement);
        assert_eq!(pass_role(2, 2), PassRole::Verify);
        assert_eq!(pass_role(2, 4), PassRole::Implement);
        assert_eq!(pass_role(3, 4), PassRole::Implement);
        assert_eq!(pass_role(4, 4), PassRole::Verify);
    }

    #[test]
    fn instructions_name_task_and_marker() {
        let task = Path::new("todo/todo-cache.md");
        let notes = Path::new(".foreman/todo-cache-implemented.md");

        let implement = render_instruction(PassRole::Implement, task, notes);
        assert!(implement.contains("todo/todo-cache.md"));
        assert!(implement.contains(COMPLETION_MARKER));
        assert!(implement.starts_with("Read the task file"));

        let verify = render_instruction(PassRole::Verify, task, notes);
        assert!(verify.contains("todo/todo-cache.md"));
        assert!(verify.contains(".foreman/todo-cache-implemented.md"));
        assert!(verify.contains("Verify"));
        assert!(verify.contains(COMPLETION_MARKER));
    }

    #[test]
    fn marker_is_substring_match() {
        assert!(has_completion_marker("FOREMAN_TASK_COMPLETE"));
        assert!(has_completion_marker("  done: FOREMAN_TASK_COMPLETE  "));
        assert!(!has_completion_marker("FOREMAN_TASK_INCOMPLETE"));
    }
}
