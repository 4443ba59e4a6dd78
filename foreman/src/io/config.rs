//! Supervisor configuration stored under `.foreman/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::policy::RetryPolicy;

/// Supervisor configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the
/// values the supervisor ships with; CLI flags override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForemanConfig {
    /// Seconds between control-loop ticks (queue scans, exit checks).
    pub poll_interval_secs: u64,

    /// Seconds between iterative-agent status polls while a job runs.
    pub status_interval_secs: u64,

    /// Timeout for one status command invocation.
    pub status_timeout_secs: u64,

    /// Iteration cap handed to the iterative agent.
    pub max_iterations: u32,

    /// Restarts allowed after a clean exit with unfinished work (0 = unlimited).
    pub max_retries: u32,

    /// Restarts allowed after a nonzero exit (0 = no retry).
    pub max_error_retries: u32,

    /// Extra wait past a parsed rate-limit reset time.
    pub rate_limit_margin_secs: u64,

    /// Wait used when a rate-limit reset time cannot be parsed.
    pub rate_limit_fallback_secs: u64,

    /// Watched queue directory, relative to the working directory.
    pub queue_dir: String,

    /// Archive root, relative to the working directory.
    pub archive_dir: String,

    pub iterative_agent: IterativeAgentConfig,

    pub prompt_agent: PromptAgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IterativeAgentConfig {
    /// Executable of the iterative agent.
    pub program: String,
    /// Execution profile: agent name passed via `--agent`.
    pub agent: String,
    /// Execution profile: model passed via `--model` when set.
    pub model: Option<String>,
    /// Pass `--no-allow-all` when false.
    pub allow_all: bool,
    /// Agent-owned working-state directory.
    pub state_dir: String,
    /// Required suffix of `<program> --version` (empty = any version).
    pub required_version_suffix: String,
    /// Extra flags forwarded verbatim.
    pub extra_args: Vec<String>,
    /// Stream log path (`--log-file`), relative to the working directory.
    /// Unset means `.foreman/<stem>-stream-<timestamp>.log` per attempt.
    pub stream_log: Option<String>,
    /// Run the agent inside a terminal window so it can be watched live.
    pub terminal: bool,
    /// Terminal launcher; the wrapped shell command is appended. `{task}` is
    /// replaced with the queue entry name.
    pub terminal_command: Vec<String>,
}

impl Default for IterativeAgentConfig {
    fn default() -> Self {
        Self {
            program: "ralph".to_string(),
            agent: "claude-code".to_string(),
            model: None,
            allow_all: true,
            state_dir: ".ralph".to_string(),
            required_version_suffix: "-logfile".to_string(),
            extra_args: Vec::new(),
            stream_log: None,
            terminal: false,
            terminal_command: vec![
                "gnome-terminal".to_string(),
                "--wait".to_string(),
                "--title=foreman: {task}".to_string(),
                "--".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptAgentConfig {
    /// Command for direct-prompt passes; the instruction is appended as the last argument.
    pub command: Vec<String>,
    /// Model passed via `--model` when set.
    pub model: Option<String>,
}

impl Default for PromptAgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            model: None,
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            status_interval_secs: 30,
            status_timeout_secs: 30,
            max_iterations: 3,
            max_retries: 3,
            max_error_retries: 2,
            rate_limit_margin_secs: 60,
            rate_limit_fallback_secs: 30 * 60,
            queue_dir: "todo".to_string(),
            archive_dir: "done".to_string(),
            iterative_agent: IterativeAgentConfig::default(),
            prompt_agent: PromptAgentConfig::default(),
        }
    }
}

/// Upper bound for any configured wait, to keep time arithmetic in range.
const MAX_WAIT_SECS: u64 = 7 * 24 * 60 * 60;

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.status_interval_secs == 0 {
            return Err(anyhow!("status_interval_secs must be > 0"));
        }
        if self.status_timeout_secs == 0 {
            return Err(anyhow!("status_timeout_secs must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        for (name, value) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("status_interval_secs", self.status_interval_secs),
            ("rate_limit_margin_secs", self.rate_limit_margin_secs),
            ("rate_limit_fallback_secs", self.rate_limit_fallback_secs),
        ] {
            if value > MAX_WAIT_SECS {
                return Err(anyhow!("{name} must be <= {MAX_WAIT_SECS}"));
            }
        }
        if self.queue_dir.trim().is_empty() || self.archive_dir.trim().is_empty() {
            return Err(anyhow!("queue_dir and archive_dir must be non-empty"));
        }
        if self.queue_dir == self.archive_dir {
            return Err(anyhow!("queue_dir and archive_dir must differ"));
        }
        if self.iterative_agent.program.trim().is_empty() {
            return Err(anyhow!("iterative_agent.program must be non-empty"));
        }
        if self.iterative_agent.state_dir.trim().is_empty() {
            return Err(anyhow!("iterative_agent.state_dir must be non-empty"));
        }
        if self
            .iterative_agent
            .stream_log
            .as_ref()
            .is_some_and(|path| path.trim().is_empty())
        {
            return Err(anyhow!("iterative_agent.stream_log must be non-empty when set"));
        }
        if self.iterative_agent.terminal && self.iterative_agent.terminal_command.is_empty() {
            return Err(anyhow!(
                "iterative_agent.terminal_command must be non-empty when terminal is on"
            ));
        }
        if self.prompt_agent.command.is_empty() || self.prompt_agent.command[0].trim().is_empty()
        {
            return Err(anyhow!("prompt_agent.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_error_retries: self.max_error_retries,
            rate_limit_margin: Duration::from_secs(self.rate_limit_margin_secs),
            rate_limit_fallback: Duration::from_secs(self.rate_limit_fallback_secs),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
