//! Single-job supervisor for autonomous coding agents.
//!
//! Watches a queue directory (`todo/` by default), runs one task at a time
//! through an external agent, and archives finished work under `done/`.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use foreman::exit_codes;
use foreman::io::agent::CliAgent;
use foreman::io::clock::SystemClock;
use foreman::io::config::{ForemanConfig, load_config};
use foreman::io::init::{ForemanPaths, InitOptions, init_foreman};
use foreman::logging;
use foreman::supervisor::Supervisor;

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Run queued agent tasks one at a time"
)]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the queue and archive directories and `.foreman/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Watch the queue and run tasks until interrupted.
    Run(RunArgs),
}

/// Overrides for `.foreman/config.toml`.
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Seconds between queue scans and exit checks.
    #[arg(long, value_name = "SECS")]
    poll_interval: Option<u64>,

    /// Seconds between agent status polls.
    #[arg(long, value_name = "SECS")]
    status_interval: Option<u64>,

    /// Iteration cap passed to the iterative agent.
    #[arg(long, value_name = "N")]
    max_iterations: Option<u32>,

    /// Restarts after a clean exit with unfinished work (0 = unlimited).
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Restarts after a nonzero exit (0 = no retry).
    #[arg(long, value_name = "N")]
    max_error_retries: Option<u32>,

    /// Agent name for the iterative agent.
    #[arg(long)]
    agent: Option<String>,

    /// Model for both agents.
    #[arg(long)]
    model: Option<String>,

    /// Pass `--no-allow-all` to the iterative agent.
    #[arg(long)]
    no_allow_all: bool,

    /// Run the iterative agent in a terminal window to watch it live.
    #[arg(long)]
    term: bool,

    /// Stream log path for the iterative agent (default: one per attempt under .foreman/).
    #[arg(long, value_name = "PATH")]
    stream_log: Option<String>,

    /// Extra flags forwarded verbatim to the iterative agent.
    #[arg(last = true, value_name = "EXTRA")]
    extra: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::INVALID);
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = std::env::current_dir().context("resolve working directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run(args) => cmd_run(&root, &args),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let paths = init_foreman(root, &InitOptions { force })?;
    println!("queue:   {}", paths.queue_dir.display());
    println!("archive: {}", paths.archive_dir.display());
    println!("config:  {}", paths.config_path.display());
    Ok(())
}

fn cmd_run(root: &Path, args: &RunArgs) -> Result<()> {
    let config_path = ForemanPaths::new(root).config_path;
    let mut config = load_config(&config_path)?;
    apply_overrides(&mut config, args);
    config.validate().context("invalid settings")?;

    let paths = ForemanPaths::with_config(root, &config);
    paths.ensure_layout()?;

    let agent = CliAgent::new(
        config.iterative_agent.clone(),
        config.prompt_agent.clone(),
        config.max_iterations,
        config.status_timeout(),
    );
    agent.check_version()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("install interrupt handler")?;

    info!(
        queue = %paths.queue_dir.display(),
        archive = %paths.archive_dir.display(),
        poll_interval_secs = config.poll_interval_secs,
        "foreman started"
    );
    let mut supervisor = Supervisor::new(config, paths, agent, SystemClock);
    supervisor.run(&shutdown)
}

fn apply_overrides(config: &mut ForemanConfig, args: &RunArgs) {
    if let Some(secs) = args.poll_interval {
        config.poll_interval_secs = secs;
    }
    if let Some(secs) = args.status_interval {
        config.status_interval_secs = secs;
    }
    if let Some(n) = args.max_iterations {
        config.max_iterations = n;
    }
    if let Some(n) = args.max_retries {
        config.max_retries = n;
    }
    if let Some(n) = args.max_error_retries {
        config.max_error_retries = n;
    }
    if let Some(agent) = &args.agent {
        config.iterative_agent.agent = agent.clone();
    }
    if let Some(model) = &args.model {
        config.iterative_agent.model = Some(model.clone());
        config.prompt_agent.model = Some(model.clone());
    }
    if args.no_allow_all {
        config.iterative_agent.allow_all = false;
    }
    if args.term {
        config.iterative_agent.terminal = true;
    }
    if let Some(path) = &args.stream_log {
        config.iterative_agent.stream_log = Some(path.clone());
    }
    if !args.extra.is_empty() {
        config
            .iterative_agent
            .extra_args
            .extend(args.extra.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["foreman", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["foreman", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_passthrough() {
        let cli = Cli::parse_from([
            "foreman",
            "run",
            "--max-error-retries",
            "0",
            "--agent",
            "opencode",
            "--term",
            "--stream-log",
            "logs/stream.log",
            "-v",
            "--",
            "--sandbox",
            "off",
        ]);
        assert!(cli.verbose);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.max_error_retries, Some(0));
        assert!(args.term);
        assert_eq!(args.stream_log.as_deref(), Some("logs/stream.log"));
        assert_eq!(args.extra, vec!["--sandbox", "off"]);
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut config = ForemanConfig::default();
        let args = RunArgs {
            poll_interval: Some(2),
            max_retries: Some(0),
            model: Some("opus".to_string()),
            no_allow_all: true,
            term: true,
            stream_log: Some("stream.log".to_string()),
            extra: vec!["--quiet".to_string()],
            ..RunArgs::default()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.iterative_agent.model.as_deref(), Some("opus"));
        assert_eq!(config.prompt_agent.model.as_deref(), Some("opus"));
        assert!(!config.iterative_agent.allow_all);
        assert!(config.iterative_agent.terminal);
        assert_eq!(config.iterative_agent.stream_log.as_deref(), Some("stream.log"));
        assert_eq!(config.iterative_agent.extra_args, vec!["--quiet"]);
        assert_eq!(config.max_error_retries, 2);
    }
}
