//! Reader for the iterative agent's loop sidecar (`<state_dir>/ralph-loop.state.json`).

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

/// File name of the sidecar inside the agent state directory.
pub const SIDECAR_FILE: &str = "ralph-loop.state.json";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoopSidecar {
    active: bool,
}

/// Whether the agent reports a loop running. Any read or parse failure means not active.
pub fn is_loop_active(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    match serde_json::from_str::<LoopSidecar>(&contents) {
        Ok(sidecar) => sidecar.active,
        Err(err) => {
            debug!(path = %path.display(), err = %err, "unparseable loop sidecar");
            false
        }
    }
}
