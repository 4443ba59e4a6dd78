//! The job state machine: one active job at a time, driven by a polling loop.
//!
//! ```text
//! Idle ──pick──▶ Starting ──spawn──▶ Running ──exit──▶ policy
//!                   ▲                                  │
//!                   ├──────── Retry / next pass ◀──────┤
//!                   └── AwaitingRateLimitReset ◀─ Wait ┤
//!                                                      └─▶ finalize ─▶ Idle
//! ```
//!
//! After a restart, a persisted iterative job is reconciled against the agent's
//! live status; it may finish immediately or continue as `ResumedMonitoring`,
//! where the orphaned agent is watched through its status command only. A
//! persisted direct-prompt job is dropped and re-offered by the queue.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::core::policy::{Attempt, Decision, RetryPolicy};
use crate::core::progress::{is_all_complete, is_no_active_loop, parse_progress};
use crate::core::prompt::{pass_role, render_instruction};
use crate::core::types::{
    ExitCode, FailureReason, JobKind, Outcome, Progress, TaskDescriptor, task_stem,
};
use crate::io::agent::{Agent, AgentRun, IterativeRequest, PromptRequest};
use crate::io::archive::{
    ArchiveReport, PromptSummary, backup_stale_agent_state, finalize_iterative, finalize_prompt,
    set_aside_prompt_artifacts, timestamp,
};
use crate::io::clock::Clock;
use crate::io::config::ForemanConfig;
use crate::io::init::ForemanPaths;
use crate::io::job_state::{JobState, load_job_state, write_job_state};
use crate::io::process::append_log_line;
use crate::io::scanner::scan_queue;
use crate::io::sidecar::is_loop_active;

/// Observable state of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Idle,
    /// The active job's next attempt starts on the next tick.
    Starting,
    Running { pass: u32 },
    AwaitingRateLimitReset { until: DateTime<Utc> },
    ResumedMonitoring,
}

/// A job that reached a final outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub task: PathBuf,
    pub kind: JobKind,
    pub outcome: Outcome,
    pub archive: ArchiveReport,
}

struct ActiveRun {
    run: Box<dyn AgentRun>,
    next_status_poll: DateTime<Utc>,
}

enum Phase {
    Idle,
    Starting,
    Running(ActiveRun),
    AwaitingRateLimitReset { until: DateTime<Utc> },
    ResumedMonitoring { next_poll: DateTime<Utc> },
}

/// Owns the persisted job record and drives the active job to completion.
pub struct Supervisor<A: Agent, C: Clock> {
    config: ForemanConfig,
    paths: ForemanPaths,
    policy: RetryPolicy,
    agent: A,
    clock: C,
    state: JobState,
    phase: Phase,
}

impl<A: Agent, C: Clock> Supervisor<A, C> {
    pub fn new(config: ForemanConfig, paths: ForemanPaths, agent: A, clock: C) -> Self {
        let policy = config.retry_policy();
        Self {
            config,
            paths,
            policy,
            agent,
            clock,
            state: JobState::default(),
            phase: Phase::Idle,
        }
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn phase(&self) -> SupervisorPhase {
        match &self.phase {
            Phase::Idle => SupervisorPhase::Idle,
            Phase::Starting => SupervisorPhase::Starting,
            Phase::Running(_) => SupervisorPhase::Running {
                pass: self.state.pass_index,
            },
            Phase::AwaitingRateLimitReset { until } => {
                SupervisorPhase::AwaitingRateLimitReset { until: *until }
            }
            Phase::ResumedMonitoring { .. } => SupervisorPhase::ResumedMonitoring,
        }
    }

    /// Run until `shutdown` is set. A running agent is left alive on shutdown.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        if let Some(done) = self.reconcile()? {
            log_finalized(&done);
        }
        while !shutdown.load(Ordering::SeqCst) {
            if let Some(done) = self.tick(shutdown)? {
                log_finalized(&done);
            }
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            if matches!(self.phase, Phase::Starting) {
                continue;
            }
            self.clock.sleep(self.config.poll_interval(), shutdown);
        }
        self.persist()?;
        match &self.phase {
            Phase::Running(active) => info!(
                task = ?self.state.active_task,
                pid = ?active.run.pid(),
                "shutting down; agent left running"
            ),
            _ => info!(task = ?self.state.active_task, "shutting down"),
        }
        Ok(())
    }

    /// Load the persisted record and settle any job left over from a previous run.
    ///
    /// The agent's live status wins over the local record.
    #[instrument(skip_all)]
    pub fn reconcile(&mut self) -> Result<Option<Finalized>> {
        self.state = load_job_state(&self.paths.state_path);
        self.phase = Phase::Idle;
        let Some(task) = self.state.active_task.clone() else {
            debug!("no persisted job");
            return Ok(None);
        };

        match self.state.kind {
            Some(JobKind::Iterative) => {
                let status = self.agent.status();
                info!(
                    task = %task.display(),
                    progress = %describe(parse_progress(&status)),
                    "found persisted iterative job"
                );
                self.settle_stopped_or_monitor(&status, false)
            }
            kind => {
                info!(
                    task = %task.display(),
                    kind = ?kind,
                    "dropping interrupted direct-prompt job; it restarts from pass 1"
                );
                let artifacts = self.job_artifacts(&task, JobKind::DirectPrompt)?;
                set_aside_prompt_artifacts(&self.paths, &task, &artifacts, self.clock.now())?;
                self.state.clear_active();
                self.persist()?;
                Ok(None)
            }
        }
    }

    /// One control-loop step. Returns the job finalized during this step, if any.
    pub fn tick(&mut self, shutdown: &AtomicBool) -> Result<Option<Finalized>> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => self.pick_next(),
            Phase::Starting => self.launch(),
            Phase::Running(active) => self.poll_running(active),
            Phase::AwaitingRateLimitReset { until } => {
                if self.clock.sleep_until(until, shutdown) {
                    self.phase = Phase::AwaitingRateLimitReset { until };
                    return Ok(None);
                }
                info!(task = ?self.state.active_task, "rate-limit wait over, restarting");
                self.state.resume_at = None;
                self.persist()?;
                self.launch()
            }
            Phase::ResumedMonitoring { next_poll } => self.poll_resumed(next_poll),
        }
    }

    fn pick_next(&mut self) -> Result<Option<Finalized>> {
        let tasks = scan_queue(&self.paths.queue_dir)?;
        let names: Vec<String> = tasks.iter().map(TaskDescriptor::name).collect();
        if self.state.release_missing(&names) {
            self.persist()?;
        }
        let Some(task) = tasks
            .into_iter()
            .find(|task| !self.state.is_held(&task.name()))
        else {
            return Ok(None);
        };

        match task.kind {
            JobKind::Iterative => {
                if is_loop_active(&self.paths.sidecar_path) {
                    info!(
                        task = %task.name(),
                        "agent reports a loop already active; retrying next tick"
                    );
                    return Ok(None);
                }
                backup_stale_agent_state(&self.paths, self.clock.now())?;
                self.state.activate(task.path.clone(), JobKind::Iterative, 1);
            }
            JobKind::DirectPrompt => {
                self.state
                    .activate(task.path.clone(), JobKind::DirectPrompt, task.passes);
            }
        }
        info!(
            task = %task.name(),
            kind = ?task.kind,
            passes = task.passes,
            "picked task"
        );
        self.persist()?;
        self.launch()
    }

    /// Start the current attempt of the active job.
    ///
    /// A spawn failure counts as an errored attempt and may finalize the job.
    fn launch(&mut self) -> Result<Option<Finalized>> {
        let (task, kind) = self.active()?;
        let now = self.clock.now();
        let stem = stem_of(&task);
        let spawned = match kind {
            JobKind::Iterative => {
                let ts = timestamp(now);
                let stream_log = match &self.config.iterative_agent.stream_log {
                    Some(path) => self.paths.root.join(path),
                    None => self.paths.work_dir.join(format!("{stem}-stream-{ts}.log")),
                };
                let request = IterativeRequest {
                    task: task.clone(),
                    output_log: self.paths.work_dir.join(format!("{stem}-output-{ts}.log")),
                    stream_log,
                };
                self.state.agent_log = Some(request.stream_log.clone());
                self.persist()?;
                append_log_line(
                    &request.output_log,
                    &format!(
                        "--- foreman: attempt started {} (retries {}, errors {})",
                        now.to_rfc3339(),
                        self.state.retry_count,
                        self.state.error_retry_count
                    ),
                )?;
                self.agent.spawn_iterative(&request)
            }
            JobKind::DirectPrompt => {
                let pass = self.state.pass_index;
                let total = self.state.total_passes;
                let role = pass_role(pass, total);
                let request = PromptRequest {
                    task: task.clone(),
                    pass,
                    total_passes: total,
                    instruction: render_instruction(role, &task, &self.notes_path(&task)),
                    log_path: self.paths.work_dir.join(format!("{stem}-pass{pass}.log")),
                };
                append_log_line(
                    &request.log_path,
                    &format!(
                        "--- foreman: pass {pass}/{total} ({}) started {}",
                        role.label(),
                        now.to_rfc3339()
                    ),
                )?;
                self.agent.spawn_prompt(&request)
            }
        };

        match spawned {
            Ok(run) => {
                info!(
                    task = %task.display(),
                    pass = self.state.pass_index,
                    pid = ?run.pid(),
                    "agent started"
                );
                self.phase = Phase::Running(ActiveRun {
                    run,
                    next_status_poll: now + status_delta(&self.config),
                });
                Ok(None)
            }
            Err(err) => {
                error!(task = %task.display(), err = %format!("{err:#}"), "agent failed to start");
                // Nothing ran, so there is no status to consult.
                self.apply(Attempt {
                    exit: ExitCode::Failure(None),
                    finished: false,
                    rate_limit: None,
                    unfinished_is_final: None,
                })
            }
        }
    }

    fn poll_running(&mut self, mut active: ActiveRun) -> Result<Option<Finalized>> {
        let Some(report) = active.run.try_finish()? else {
            let now = self.clock.now();
            if self.state.kind == Some(JobKind::Iterative) && now >= active.next_status_poll {
                let status = self.agent.status();
                info!(
                    task = ?self.state.active_task,
                    progress = %describe(parse_progress(&status)),
                    "agent running"
                );
                active.next_status_poll = now + status_delta(&self.config);
            }
            self.phase = Phase::Running(active);
            return Ok(None);
        };

        let (task, kind) = self.active()?;
        info!(
            task = %task.display(),
            exit = ?report.exit,
            rate_limited = report.rate_limit.is_some(),
            marker = report.marker_seen,
            "agent exited"
        );
        let attempt = match kind {
            JobKind::Iterative => {
                let status = self.agent.status();
                debug!(progress = %describe(parse_progress(&status)), "status after exit");
                Attempt {
                    exit: report.exit,
                    finished: is_all_complete(&status),
                    rate_limit: report.rate_limit,
                    unfinished_is_final: None,
                }
            }
            JobKind::DirectPrompt => {
                let last = self.state.pass_index >= self.state.total_passes;
                if !last && !report.marker_seen && report.exit == ExitCode::Success {
                    warn!(
                        task = %task.display(),
                        pass = self.state.pass_index,
                        "pass ended without completion marker"
                    );
                }
                Attempt {
                    exit: report.exit,
                    finished: if last {
                        report.marker_seen
                    } else {
                        report.marker_seen || report.rate_limit.is_none()
                    },
                    rate_limit: report.rate_limit,
                    unfinished_is_final: last.then_some(FailureReason::MarkerMissing),
                }
            }
        };
        self.apply(attempt)
    }

    /// Apply the retry policy to a finished attempt.
    fn apply(&mut self, attempt: Attempt) -> Result<Option<Finalized>> {
        let mut counters = self.state.counters();
        let decision = self
            .policy
            .decide(&attempt, &mut counters, self.clock.now());
        self.state.set_counters(counters);

        match decision {
            Decision::Advance => {
                if self.state.kind == Some(JobKind::DirectPrompt)
                    && self.state.pass_index < self.state.total_passes
                {
                    self.state.pass_index += 1;
                    info!(
                        task = ?self.state.active_task,
                        pass = self.state.pass_index,
                        total_passes = self.state.total_passes,
                        "advancing to next pass"
                    );
                    self.persist()?;
                    self.phase = Phase::Starting;
                    return Ok(None);
                }
                self.finalize(Outcome::Success).map(Some)
            }
            Decision::WaitUntil(until) => {
                warn!(
                    task = ?self.state.active_task,
                    until = %until.to_rfc3339(),
                    "rate limited; waiting for reset"
                );
                self.state.resume_at = Some(until);
                self.persist()?;
                self.phase = Phase::AwaitingRateLimitReset { until };
                Ok(None)
            }
            Decision::Retry => {
                info!(
                    task = ?self.state.active_task,
                    retry_count = self.state.retry_count,
                    error_retry_count = self.state.error_retry_count,
                    "restarting attempt"
                );
                self.persist()?;
                self.phase = Phase::Starting;
                Ok(None)
            }
            Decision::Fail(reason) => self.finalize(Outcome::Failure(reason)).map(Some),
        }
    }

    fn poll_resumed(&mut self, next_poll: DateTime<Utc>) -> Result<Option<Finalized>> {
        let now = self.clock.now();
        if now < next_poll {
            self.phase = Phase::ResumedMonitoring { next_poll };
            return Ok(None);
        }
        let status = self.agent.status();
        if !is_no_active_loop(&status) {
            debug!(
                progress = %describe(parse_progress(&status)),
                "resumed agent still active"
            );
            self.phase = Phase::ResumedMonitoring {
                next_poll: now + status_delta(&self.config),
            };
            return Ok(None);
        }
        self.settle_stopped_or_monitor(&status, true)
    }

    /// Decide a recovered iterative job from status text.
    fn settle_stopped_or_monitor(
        &mut self,
        status: &str,
        stopped: bool,
    ) -> Result<Option<Finalized>> {
        if is_all_complete(status) {
            return self.finalize(Outcome::Success).map(Some);
        }
        if stopped || is_no_active_loop(status) {
            if let Some(until) = self.state.resume_at {
                info!(until = %until.to_rfc3339(), "resuming rate-limit wait");
                self.phase = Phase::AwaitingRateLimitReset { until };
                return Ok(None);
            }
            return self
                .finalize(Outcome::Failure(FailureReason::StoppedIncomplete))
                .map(Some);
        }
        info!(task = ?self.state.active_task, "agent still active; monitoring via status");
        self.phase = Phase::ResumedMonitoring {
            next_poll: self.clock.now() + status_delta(&self.config),
        };
        Ok(None)
    }

    #[instrument(skip_all, fields(outcome = ?outcome))]
    fn finalize(&mut self, outcome: Outcome) -> Result<Finalized> {
        let (task, kind) = self.active()?;
        let now = self.clock.now();
        info!(task = %task.display(), "finalizing");
        let artifacts = self.job_artifacts(&task, kind)?;
        let archive = match kind {
            JobKind::Iterative => finalize_iterative(&self.paths, &task, outcome, &artifacts, now)?,
            JobKind::DirectPrompt => {
                let summary = PromptSummary {
                    outcome,
                    passes_run: self.state.pass_index,
                    total_passes: self.state.total_passes,
                };
                finalize_prompt(&self.paths, &task, &summary, &artifacts, now)?
            }
        };

        if let Outcome::Failure(reason) = outcome {
            let name = file_name_of(&task);
            self.state.hold(&name);
            if kind == JobKind::Iterative {
                error!(
                    task = %task.display(),
                    reason = %reason,
                    resume = %self.agent.resume_hint(&task),
                    release = %release_hint(&name),
                    "task failed; left in queue. Resume manually with the command shown"
                );
            } else {
                error!(
                    task = %task.display(),
                    reason = %reason,
                    release = %release_hint(&name),
                    "task failed; left in queue"
                );
            }
        }
        self.state.clear_active();
        self.persist()?;
        self.phase = Phase::Idle;
        Ok(Finalized {
            task,
            kind,
            outcome,
            archive,
        })
    }

    /// Log and notes files of the active job under the work directory.
    fn job_artifacts(&self, task: &Path, kind: JobKind) -> Result<Vec<PathBuf>> {
        let stem = stem_of(task);
        let notes = format!("{stem}-implemented.md");
        let prefixes: Vec<String> = match kind {
            JobKind::Iterative => vec![format!("{stem}-output-"), format!("{stem}-stream-")],
            JobKind::DirectPrompt => vec![format!("{stem}-pass")],
        };
        let mut found = Vec::new();
        if self.paths.work_dir.is_dir() {
            let entries = fs::read_dir(&self.paths.work_dir)
                .with_context(|| format!("read {}", self.paths.work_dir.display()))?;
            for entry in entries {
                let entry = entry
                    .with_context(|| format!("read entry in {}", self.paths.work_dir.display()))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_log = name.ends_with(".log")
                    && prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()));
                if is_log || (kind == JobKind::DirectPrompt && name == notes) {
                    found.push(entry.path());
                }
            }
        }
        // An overridden stream log may live outside the work directory.
        if kind == JobKind::Iterative
            && let Some(log) = &self.state.agent_log
            && !found.contains(log)
        {
            found.push(log.clone());
        }
        found.sort();
        Ok(found)
    }

    fn notes_path(&self, task: &Path) -> PathBuf {
        self.paths
            .work_dir
            .join(format!("{}-implemented.md", stem_of(task)))
    }

    fn active(&self) -> Result<(PathBuf, JobKind)> {
        match (&self.state.active_task, self.state.kind) {
            (Some(task), Some(kind)) => Ok((task.clone(), kind)),
            _ => Err(anyhow!("no active job")),
        }
    }

    fn persist(&self) -> Result<()> {
        write_job_state(&self.paths.state_path, &self.state)
    }
}

fn file_name_of(task: &Path) -> String {
    task.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn stem_of(task: &Path) -> String {
    task_stem(&file_name_of(task))
}

/// How an operator gets a held task picked up again.
fn release_hint(name: &str) -> String {
    format!("held until {name} leaves the queue; remove it, or rename it to run it again")
}

fn status_delta(config: &ForemanConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.status_interval()).unwrap_or(chrono::Duration::MAX)
}

fn describe(progress: Progress) -> String {
    match progress {
        Progress::Known { done, total } => format!("{done}/{total}"),
        Progress::Unknown => "unknown".to_string(),
    }
}

fn log_finalized(done: &Finalized) {
    match done.outcome {
        Outcome::Success => info!(
            task = %done.task.display(),
            record = ?done.archive.record,
            "task complete"
        ),
        Outcome::Failure(reason) => warn!(
            task = %done.task.display(),
            reason = %reason,
            logs = done.archive.logs.len(),
            "task finalized as failure"
        ),
    }
}
