//! Test doubles for the supervisor: a scripted agent, a manual clock and a
//! temporary workspace.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};

use crate::core::types::{ExitCode, RateLimitHit};
use crate::io::agent::{Agent, AgentRun, IterativeRequest, PromptRequest, RunReport};
use crate::io::clock::Clock;
use crate::io::config::ForemanConfig;
use crate::io::init::ForemanPaths;
use crate::io::process::append_log_line;

/// Scripted result of one spawn.
#[derive(Debug, Clone)]
pub enum ScriptedSpawn {
    /// The process exits with `report` after `polls` unfinished exit checks.
    Run { report: RunReport, polls: u32 },
    /// Spawning fails.
    Fail(String),
}

impl ScriptedSpawn {
    pub fn exits(code: i32) -> Self {
        ScriptedSpawn::Run {
            report: RunReport {
                exit: ExitCode::from_code(Some(code)),
                rate_limit: None,
                marker_seen: false,
            },
            polls: 0,
        }
    }

    pub fn with_marker(code: i32) -> Self {
        ScriptedSpawn::Run {
            report: RunReport {
                exit: ExitCode::from_code(Some(code)),
                rate_limit: None,
                marker_seen: true,
            },
            polls: 0,
        }
    }

    pub fn rate_limited(code: i32, reset_at: Option<DateTime<Utc>>) -> Self {
        ScriptedSpawn::Run {
            report: RunReport {
                exit: ExitCode::from_code(Some(code)),
                rate_limit: Some(RateLimitHit { reset_at }),
                marker_seen: false,
            },
            polls: 0,
        }
    }

    /// Same run, but still alive for `polls` exit checks.
    pub fn after_polls(self, polls: u32) -> Self {
        match self {
            ScriptedSpawn::Run { report, .. } => ScriptedSpawn::Run { report, polls },
            other => other,
        }
    }
}

/// A recorded agent interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Iterative(PathBuf),
    Prompt {
        task: PathBuf,
        pass: u32,
        instruction: String,
    },
    Status,
}

/// Agent that replays scripted spawns and status texts.
///
/// Status texts are consumed in order; the last one repeats. Spawns write a line
/// to the request's log file, as a real agent would.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    spawns: RefCell<VecDeque<ScriptedSpawn>>,
    statuses: RefCell<VecDeque<String>>,
    calls: RefCell<Vec<AgentCall>>,
}

impl ScriptedAgent {
    pub fn new(spawns: Vec<ScriptedSpawn>, statuses: Vec<&str>) -> Self {
        Self {
            spawns: RefCell::new(spawns.into()),
            statuses: RefCell::new(statuses.into_iter().map(str::to_string).collect()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.borrow().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| !matches!(call, AgentCall::Status))
            .count()
    }

    pub fn status_count(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| matches!(call, AgentCall::Status))
            .count()
    }

    pub fn prompt_calls(&self) -> Vec<(u32, String)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                AgentCall::Prompt {
                    pass, instruction, ..
                } => Some((*pass, instruction.clone())),
                _ => None,
            })
            .collect()
    }

    fn next_run(&self, log: &Path) -> Result<Box<dyn AgentRun>> {
        let spawn = self
            .spawns
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent: unexpected spawn"))?;
        match spawn {
            ScriptedSpawn::Run { report, polls } => {
                append_log_line(log, "scripted agent output")?;
                Ok(Box::new(ScriptedRun {
                    report,
                    polls_left: polls,
                }))
            }
            ScriptedSpawn::Fail(message) => Err(anyhow!(message)),
        }
    }
}

impl Agent for ScriptedAgent {
    fn spawn_iterative(&self, request: &IterativeRequest) -> Result<Box<dyn AgentRun>> {
        self.calls
            .borrow_mut()
            .push(AgentCall::Iterative(request.task.clone()));
        self.next_run(&request.output_log)
    }

    fn spawn_prompt(&self, request: &PromptRequest) -> Result<Box<dyn AgentRun>> {
        self.calls.borrow_mut().push(AgentCall::Prompt {
            task: request.task.clone(),
            pass: request.pass,
            instruction: request.instruction.clone(),
        });
        self.next_run(&request.log_path)
    }

    fn status(&self) -> String {
        self.calls.borrow_mut().push(AgentCall::Status);
        let mut statuses = self.statuses.borrow_mut();
        if statuses.len() > 1 {
            statuses.pop_front().unwrap_or_default()
        } else {
            statuses.front().cloned().unwrap_or_default()
        }
    }

    fn resume_hint(&self, task: &Path) -> String {
        format!("ralph --file {} --tasks --agent scripted", task.display())
    }
}

struct ScriptedRun {
    report: RunReport,
    polls_left: u32,
}

impl AgentRun for ScriptedRun {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn try_finish(&mut self) -> Result<Option<RunReport>> {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return Ok(None);
        }
        Ok(Some(self.report))
    }
}

/// Clock whose time only moves when something sleeps.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(now),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        self.now.set(self.now.get() + delta);
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep(&self, duration: Duration, shutdown: &AtomicBool) -> bool {
        self.sleeps.borrow_mut().push(duration);
        self.advance(duration);
        shutdown.load(Ordering::SeqCst)
    }
}

/// Temporary working directory with the queue and archive laid out.
pub struct TestWorkspace {
    _temp: tempfile::TempDir,
    pub paths: ForemanPaths,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let paths = ForemanPaths::new(temp.path());
        fs::create_dir_all(&paths.queue_dir).unwrap();
        fs::create_dir_all(&paths.archive_dir).unwrap();
        Self { _temp: temp, paths }
    }

    /// Queue a task file and return its path.
    pub fn add_task(&self, name: &str) -> PathBuf {
        let path = self.paths.queue_dir.join(name);
        fs::write(&path, format!("# {name}\n")).unwrap();
        path
    }

    /// Create the agent state directory with a marker file.
    pub fn add_agent_state(&self, sidecar_active: bool) {
        fs::create_dir_all(&self.paths.agent_state_dir).unwrap();
        fs::write(
            &self.paths.sidecar_path,
            format!("{{\"active\": {sidecar_active}}}"),
        )
        .unwrap();
    }

    /// Names under the archive root, sorted.
    pub fn archive_names(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.paths.archive_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Config with small, test-friendly intervals.
    pub fn config(&self) -> ForemanConfig {
        ForemanConfig {
            poll_interval_secs: 1,
            status_interval_secs: 10,
            ..ForemanConfig::default()
        }
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
