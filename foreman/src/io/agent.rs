//! Agent abstraction for task execution.
//!
//! The [`Agent`] trait decouples the supervisor from the external agent programs.
//! [`CliAgent`] spawns the real iterative agent (`ralph`) and the direct-prompt
//! agent command; tests use scripted agents that never spawn processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::prompt::has_completion_marker;
use crate::core::rate_limit::detect_rate_limit;
use crate::core::types::{ExitCode, RateLimitHit};
use crate::io::config::{IterativeAgentConfig, PromptAgentConfig};
use crate::io::process::{StreamOptions, StreamingChild, run_command_with_timeout};

const STATUS_OUTPUT_LIMIT_BYTES: usize = 256 * 1024;
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// One iterative-agent attempt.
#[derive(Debug, Clone)]
pub struct IterativeRequest {
    /// Task file handed to the agent.
    pub task: PathBuf,
    /// File receiving the agent's stdout/stderr.
    pub output_log: PathBuf,
    /// Stream log the agent writes itself (`--log-file`).
    pub stream_log: PathBuf,
}

/// One direct-prompt pass.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub task: PathBuf,
    pub pass: u32,
    pub total_passes: u32,
    pub instruction: String,
    /// File receiving this pass's transcript.
    pub log_path: PathBuf,
}

/// What a finished agent process left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub exit: ExitCode,
    pub rate_limit: Option<RateLimitHit>,
    pub marker_seen: bool,
}

/// A spawned agent process.
pub trait AgentRun {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check. Returns the report once the process has exited.
    fn try_finish(&mut self) -> Result<Option<RunReport>>;
}

/// Abstraction over the external agents.
pub trait Agent {
    /// Start one iterative-mode attempt.
    fn spawn_iterative(&self, request: &IterativeRequest) -> Result<Box<dyn AgentRun>>;

    /// Start one direct-prompt pass.
    fn spawn_prompt(&self, request: &PromptRequest) -> Result<Box<dyn AgentRun>>;

    /// Status text of the iterative agent; empty when the command failed or timed out.
    fn status(&self) -> String;

    /// Command an operator can run to resume an iterative job by hand.
    fn resume_hint(&self, task: &std::path::Path) -> String;
}

/// Signals the log tail reports while an agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamSignal {
    RateLimit(RateLimitHit),
    Marker,
}

fn scan_line(line: &str, tx: &std::sync::mpsc::Sender<StreamSignal>) {
    if let Some(hit) = detect_rate_limit(line, Utc::now()) {
        warn!(reset_at = ?hit.reset_at, "rate-limit notice in agent output");
        let _ = tx.send(StreamSignal::RateLimit(hit));
    }
    if has_completion_marker(line) {
        let _ = tx.send(StreamSignal::Marker);
    }
}

/// Process-backed [`AgentRun`].
pub struct ProcessRun {
    child: StreamingChild<StreamSignal>,
    rate_limit: Option<RateLimitHit>,
    marker_seen: bool,
}

impl ProcessRun {
    fn spawn(cmd: Command, options: &StreamOptions) -> Result<Self> {
        let child = StreamingChild::spawn(cmd, options, scan_line)?;
        Ok(Self {
            child,
            rate_limit: None,
            marker_seen: false,
        })
    }

    fn absorb(&mut self) {
        for signal in self.child.drain() {
            match signal {
                StreamSignal::Marker => self.marker_seen = true,
                // A parsed reset time is never overwritten by an unparsed one.
                StreamSignal::RateLimit(hit) => {
                    if hit.reset_at.is_some() || self.rate_limit.is_none() {
                        self.rate_limit = Some(hit);
                    }
                }
            }
        }
    }
}

impl AgentRun for ProcessRun {
    fn pid(&self) -> Option<u32> {
        Some(self.child.pid())
    }

    fn try_finish(&mut self) -> Result<Option<RunReport>> {
        let status = self.child.try_wait()?;
        self.absorb();
        Ok(status.map(|status| RunReport {
            exit: ExitCode::from_code(status.code()),
            rate_limit: self.rate_limit,
            marker_seen: self.marker_seen,
        }))
    }
}

/// Agent backed by real executables.
#[derive(Debug, Clone)]
pub struct CliAgent {
    iterative: IterativeAgentConfig,
    prompt: PromptAgentConfig,
    max_iterations: u32,
    status_timeout: Duration,
}

impl CliAgent {
    pub fn new(
        iterative: IterativeAgentConfig,
        prompt: PromptAgentConfig,
        max_iterations: u32,
        status_timeout: Duration,
    ) -> Self {
        Self {
            iterative,
            prompt,
            max_iterations,
            status_timeout,
        }
    }

    /// Arguments for one iterative attempt (without the program).
    pub fn iterative_args(&self, request: &IterativeRequest) -> Vec<String> {
        let mut args = vec![
            "--file".to_string(),
            request.task.display().to_string(),
            "--tasks".to_string(),
            "--max-iterations".to_string(),
            self.max_iterations.to_string(),
            "--agent".to_string(),
            self.iterative.agent.clone(),
        ];
        if let Some(model) = &self.iterative.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if !self.iterative.allow_all {
            args.push("--no-allow-all".to_string());
        }
        args.push("--log-file".to_string());
        args.push(request.stream_log.display().to_string());
        args.extend(self.iterative.extra_args.iter().cloned());
        args
    }

    /// Full argv for one iterative attempt.
    ///
    /// In terminal mode the agent runs in a shell inside the configured terminal,
    /// teeing its output into the attempt log, and the window stays open until
    /// the operator presses Enter.
    pub fn iterative_argv(&self, request: &IterativeRequest) -> Result<Vec<String>> {
        let mut agent_argv = vec![self.iterative.program.clone()];
        agent_argv.extend(self.iterative_args(request));
        if !self.iterative.terminal {
            return Ok(agent_argv);
        }

        let log = request.output_log.display().to_string();
        let agent_cmd = shlex::try_join(agent_argv.iter().map(String::as_str))
            .map_err(|err| anyhow!("quote agent command: {err}"))?;
        let log_arg = shlex::try_join([log.as_str()])
            .map_err(|err| anyhow!("quote log path: {err}"))?;
        let script = format!(
            "{agent_cmd} 2>&1 | tee -a {log_arg}; echo; echo '--- agent finished, press Enter to close ---'; read _"
        );
        let name = request
            .task
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut argv: Vec<String> = self
            .iterative
            .terminal_command
            .iter()
            .map(|arg| arg.replace("{task}", &name))
            .collect();
        argv.extend(["sh".to_string(), "-c".to_string(), script]);
        Ok(argv)
    }

    /// Full argv for one direct-prompt pass.
    pub fn prompt_argv(&self, request: &PromptRequest) -> Vec<String> {
        let mut argv = self.prompt.command.clone();
        if let Some(model) = &self.prompt.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
        argv.push(request.instruction.clone());
        argv
    }

    /// Verify the iterative agent is reachable and is a supported build.
    #[instrument(skip_all, fields(program = %self.iterative.program))]
    pub fn check_version(&self) -> Result<String> {
        let mut cmd = Command::new(&self.iterative.program);
        cmd.arg("--version");
        let output = run_command_with_timeout(cmd, VERSION_TIMEOUT, 4096).map_err(|err| {
            anyhow!(
                "'{}' is not reachable ({err:#}); install it or set iterative_agent.program",
                self.iterative.program
            )
        })?;
        if output.timed_out {
            return Err(anyhow!("'{} --version' timed out", self.iterative.program));
        }
        let version = output.combined().trim().to_string();
        if version.is_empty() {
            return Err(anyhow!(
                "'{} --version' printed nothing",
                self.iterative.program
            ));
        }
        let suffix = &self.iterative.required_version_suffix;
        if !suffix.is_empty() && !version.ends_with(suffix.as_str()) {
            return Err(anyhow!(
                "'{}' version '{version}' does not end with '{suffix}' (a build with --log-file support is required)",
                self.iterative.program
            ));
        }
        info!(version = %version, "iterative agent version");
        Ok(version)
    }
}

impl Agent for CliAgent {
    fn spawn_iterative(&self, request: &IterativeRequest) -> Result<Box<dyn AgentRun>> {
        let argv = self.iterative_argv(request)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("iterative agent command is empty"))?;
        info!(
            command = %argv.join(" "),
            log = %request.output_log.display(),
            terminal = self.iterative.terminal,
            "starting iterative agent"
        );
        let mut cmd = Command::new(program);
        cmd.args(args);
        let run = ProcessRun::spawn(
            cmd,
            &StreamOptions {
                log_path: request.output_log.clone(),
                echo: false,
            },
        )?;
        Ok(Box::new(run))
    }

    fn spawn_prompt(&self, request: &PromptRequest) -> Result<Box<dyn AgentRun>> {
        let argv = self.prompt_argv(request);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("prompt_agent.command is empty"))?;
        info!(
            program = %program,
            pass = request.pass,
            total_passes = request.total_passes,
            log = %request.log_path.display(),
            "starting direct-prompt pass"
        );
        debug!(instruction = %request.instruction, "pass instruction");
        let mut cmd = Command::new(program);
        cmd.args(args);
        let run = ProcessRun::spawn(
            cmd,
            &StreamOptions {
                log_path: request.log_path.clone(),
                echo: true,
            },
        )?;
        Ok(Box::new(run))
    }

    fn status(&self) -> String {
        let mut cmd = Command::new(&self.iterative.program);
        cmd.args(["--status", "--tasks"]);
        match run_command_with_timeout(cmd, self.status_timeout, STATUS_OUTPUT_LIMIT_BYTES) {
            Ok(output) if output.timed_out => {
                warn!("agent status timed out");
                String::new()
            }
            Ok(output) => output.combined(),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not run agent status");
                String::new()
            }
        }
    }

    fn resume_hint(&self, task: &std::path::Path) -> String {
        format!(
            "{} --file {} --tasks --agent {}",
            self.iterative.program,
            task.display(),
            self.iterative.agent
        )
    }
}
