//! Restart scenarios: a supervisor starting over a persisted job record.
//!
//! Each test writes `.foreman/state.json` as a previous process would have left
//! it, then reconciles a fresh supervisor against scripted agent status.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use foreman::core::types::{FailureReason, JobKind, Outcome};
use foreman::io::clock::Clock;
use foreman::io::job_state::{JobState, load_job_state, write_job_state};
use foreman::supervisor::{Supervisor, SupervisorPhase};
use foreman::test_support::{ManualClock, ScriptedAgent, ScriptedSpawn, TestWorkspace};

fn persist_active(ws: &TestWorkspace, task: PathBuf, kind: JobKind, pass: u32, total: u32) {
    let state = JobState {
        active_task: Some(task),
        kind: Some(kind),
        retry_count: 1,
        pass_index: pass,
        total_passes: total,
        ..JobState::default()
    };
    write_job_state(&ws.paths.state_path, &state).expect("write state");
}

fn supervisor(ws: &TestWorkspace, agent: ScriptedAgent) -> Supervisor<ScriptedAgent, ManualClock> {
    Supervisor::new(ws.config(), ws.paths.clone(), agent, ManualClock::default())
}

#[test]
fn completed_iterative_job_finalizes_without_respawning() {
    let ws = TestWorkspace::new();
    let task = ws.add_task("prd-4-billing.md");
    ws.add_agent_state(false);
    persist_active(&ws, task.clone(), JobKind::Iterative, 1, 1);

    let agent = ScriptedAgent::new(vec![], vec!["No active loop\nProgress: 5/5 complete"]);
    let mut sup = supervisor(&ws, agent);
    let done = sup.reconcile().expect("reconcile").expect("finalized");

    assert_eq!(done.outcome, Outcome::Success);
    assert_eq!(sup.agent().spawn_count(), 0);
    assert!(!task.exists());
    assert!(!ws.paths.agent_state_dir.exists(), "agent state archived");
    let record = done.archive.record.expect("record");
    assert!(record.join("ralph-loop.state.json").is_file());
    assert!(!load_job_state(&ws.paths.state_path).is_active());
}

#[test]
fn stopped_incomplete_job_finalizes_as_failure() {
    let ws = TestWorkspace::new();
    let task = ws.add_task("prd-4-billing.md");
    ws.add_agent_state(false);
    persist_active(&ws, task.clone(), JobKind::Iterative, 1, 1);

    let agent = ScriptedAgent::new(
        vec![],
        vec!["No active loop\n  1. \u{2705} schema\n  2. \u{2b1c} api\n"],
    );
    let mut sup = supervisor(&ws, agent);
    let done = sup.reconcile().expect("reconcile").expect("finalized");

    assert_eq!(
        done.outcome,
        Outcome::Failure(FailureReason::StoppedIncomplete)
    );
    assert!(task.is_file(), "task left for manual inspection");
    assert!(ws.paths.agent_state_dir.is_dir(), "agent state left in place");
    assert_eq!(sup.state().held, vec!["prd-4-billing.md".to_string()]);
}

#[test]
fn live_agent_is_monitored_until_it_stops() {
    let ws = TestWorkspace::new();
    let task = ws.add_task("prd-4-billing.md");
    persist_active(&ws, task.clone(), JobKind::Iterative, 1, 1);

    let agent = ScriptedAgent::new(
        vec![],
        vec![
            "Loop running\nProgress: 1/3 complete",
            "Loop running\nProgress: 2/3 complete",
            "No active loop\nProgress: 3/3 complete",
        ],
    );
    let mut sup = supervisor(&ws, agent);
    let shutdown = AtomicBool::new(false);

    assert_eq!(sup.reconcile().expect("reconcile"), None);
    assert_eq!(sup.phase(), SupervisorPhase::ResumedMonitoring);

    // Not due yet.
    assert_eq!(sup.tick(&shutdown).expect("tick"), None);
    assert_eq!(sup.agent().status_count(), 1);

    sup.clock().advance(std::time::Duration::from_secs(10));
    assert_eq!(sup.tick(&shutdown).expect("tick"), None);
    assert_eq!(sup.phase(), SupervisorPhase::ResumedMonitoring);

    sup.clock().advance(std::time::Duration::from_secs(10));
    let done = sup.tick(&shutdown).expect("tick").expect("finalized");
    assert_eq!(done.outcome, Outcome::Success);
    assert_eq!(sup.agent().spawn_count(), 0);
}

#[test]
fn interrupted_direct_prompt_job_restarts_from_pass_one() {
    let ws = TestWorkspace::new();
    let task = ws.add_task("todo-cache.p2.md");
    persist_active(&ws, task.clone(), JobKind::DirectPrompt, 2, 2);

    let agent = ScriptedAgent::new(vec![ScriptedSpawn::exits(0)], vec![]);
    let mut sup = supervisor(&ws, agent);
    assert_eq!(sup.reconcile().expect("reconcile"), None);
    assert_eq!(sup.phase(), SupervisorPhase::Idle);
    assert!(!load_job_state(&ws.paths.state_path).is_active());

    sup.tick(&AtomicBool::new(false)).expect("tick");
    assert_eq!(sup.state().active_task.as_deref(), Some(task.as_path()));
    assert_eq!(sup.agent().prompt_calls()[0].0, 1);
}

#[test]
fn interrupted_direct_prompt_logs_do_not_leak_into_the_rerun() {
    let ws = TestWorkspace::new();
    let task = ws.add_task("todo-cache.p2.md");
    persist_active(&ws, task.clone(), JobKind::DirectPrompt, 2, 2);
    fs::create_dir_all(&ws.paths.work_dir).expect("work dir");
    let pass1 = ws.paths.work_dir.join("todo-cache.p2-pass1.log");
    let notes = ws.paths.work_dir.join("todo-cache.p2-implemented.md");
    fs::write(&pass1, "aborted transcript\n").expect("pass1");
    fs::write(&notes, "- aborted notes\n").expect("notes");

    let agent = ScriptedAgent::new(vec![ScriptedSpawn::exits(0)], vec![]);
    let mut sup = supervisor(&ws, agent);
    assert_eq!(sup.reconcile().expect("reconcile"), None);

    assert!(!pass1.exists());
    assert!(!notes.exists());
    let stale: Vec<String> = ws
        .archive_names()
        .into_iter()
        .filter(|name| name.starts_with("stale-todo-cache.p2-prompt-"))
        .collect();
    assert_eq!(stale.len(), 1);
    let stale_dir = ws.paths.archive_dir.join(&stale[0]);
    assert_eq!(
        fs::read_to_string(stale_dir.join("todo-cache.p2-pass1.log")).expect("read"),
        "aborted transcript\n"
    );

    sup.tick(&AtomicBool::new(false)).expect("tick");
    let rerun = fs::read_to_string(&pass1).expect("fresh pass log");
    assert!(!rerun.contains("aborted transcript"));
}

#[test]
fn interrupted_rate_limit_wait_resumes_waiting() {
    let ws = TestWorkspace::new();
    let task = ws.add_task("prd-4-billing.md");
    let until = ManualClock::default().now() + chrono::Duration::minutes(45);
    let state = JobState {
        active_task: Some(task),
        kind: Some(JobKind::Iterative),
        pass_index: 1,
        total_passes: 1,
        resume_at: Some(until),
        ..JobState::default()
    };
    write_job_state(&ws.paths.state_path, &state).expect("write state");

    let agent = ScriptedAgent::new(vec![], vec!["No active loop\nProgress: 1/3 complete"]);
    let mut sup = supervisor(&ws, agent);
    assert_eq!(sup.reconcile().expect("reconcile"), None);
    assert_eq!(
        sup.phase(),
        SupervisorPhase::AwaitingRateLimitReset { until }
    );
}

#[test]
fn shutdown_persists_state_and_returns() {
    let ws = TestWorkspace::new();
    let task = ws.add_task("prd-4-billing.md");
    persist_active(&ws, task.clone(), JobKind::Iterative, 1, 1);

    let agent = ScriptedAgent::new(vec![], vec!["Loop running\nProgress: 1/3 complete"]);
    let mut sup = supervisor(&ws, agent);
    sup.run(&AtomicBool::new(true)).expect("run");

    let state = load_job_state(&ws.paths.state_path);
    assert_eq!(state.active_task.as_deref(), Some(task.as_path()));
    assert_eq!(state.retry_count, 1);
    assert_eq!(sup.agent().spawn_count(), 0);
}
