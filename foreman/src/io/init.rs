//! Workspace paths and `foreman init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{ForemanConfig, write_config};
use super::sidecar::SIDECAR_FILE;

/// Directory holding foreman's own files (state, config, live logs).
pub const WORK_DIR: &str = ".foreman";

/// All canonical paths for a working directory.
#[derive(Debug, Clone)]
pub struct ForemanPaths {
    pub root: PathBuf,
    pub work_dir: PathBuf,
    pub state_path: PathBuf,
    pub config_path: PathBuf,
    pub queue_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub agent_state_dir: PathBuf,
    pub sidecar_path: PathBuf,
}

impl ForemanPaths {
    /// Paths with the default directory names.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, &ForemanConfig::default())
    }

    /// Paths using the directory names from `config`.
    pub fn with_config(root: impl Into<PathBuf>, config: &ForemanConfig) -> Self {
        let root = root.into();
        let work_dir = root.join(WORK_DIR);
        let agent_state_dir = root.join(&config.iterative_agent.state_dir);
        Self {
            root: root.clone(),
            work_dir: work_dir.clone(),
            state_path: work_dir.join("state.json"),
            config_path: work_dir.join("config.toml"),
            queue_dir: root.join(&config.queue_dir),
            archive_dir: root.join(&config.archive_dir),
            sidecar_path: agent_state_dir.join(SIDECAR_FILE),
            agent_state_dir,
        }
    }

    /// Fail unless the queue and archive directories exist.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [&self.queue_dir, &self.archive_dir] {
            if !dir.is_dir() {
                return Err(anyhow!(
                    "missing directory {} (run `foreman init` first)",
                    dir.display()
                ));
            }
        }
        Ok(())
    }
}

/// Options for `init_foreman`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

const WORK_DIR_GITIGNORE: &str = "*\n";

/// Create the queue, archive and `.foreman/` directories plus a default config.
///
/// Existing directories are kept. An existing config is only replaced with `force`.
pub fn init_foreman(root: &Path, options: &InitOptions) -> Result<ForemanPaths> {
    let config_path = root.join(WORK_DIR).join("config.toml");
    if config_path.exists() && !options.force {
        return Err(anyhow!(
            "foreman init: {} already exists (use --force to overwrite)",
            config_path.display()
        ));
    }

    let config = ForemanConfig::default();
    let paths = ForemanPaths::with_config(root, &config);
    create_dir(&paths.work_dir)?;
    create_dir(&paths.queue_dir)?;
    create_dir(&paths.archive_dir)?;

    let gitignore = paths.work_dir.join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, WORK_DIR_GITIGNORE)
            .with_context(|| format!("write file {}", gitignore.display()))?;
    }
    write_config(&paths.config_path, &config)?;

    info!(root = %root.display(), "initialized foreman workspace");
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}
