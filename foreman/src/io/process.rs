//! Helpers for running child processes.
//!
//! Two shapes are needed: short commands with a timeout and captured output
//! (status and version queries), and long-lived agent processes whose output goes
//! straight to a log file. Agent output is never piped to the supervisor: a
//! pipe would break the child (SIGPIPE) once the supervisor exits, and agents
//! must survive a supervisor restart. A background thread tails the log file
//! instead and reports what it sees over a channel.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const TAIL_IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            buf.extend_from_slice(&chunk[..n.min(remaining)]);
        }
    }

    Ok(buf)
}

/// Options for a log-backed agent process.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// File receiving stdout and stderr (appended to).
    pub log_path: PathBuf,
    /// Echo each line to the operator console.
    pub echo: bool,
}

/// A running child whose output is tailed from its log file.
///
/// The tail thread calls `on_line` for every complete line; whatever it sends on
/// the channel is drained by the owner. Dropping the handle leaves the child
/// running.
pub struct StreamingChild<S> {
    child: Child,
    exited: Arc<AtomicBool>,
    tail: Option<thread::JoinHandle<()>>,
    signals: Receiver<S>,
}

impl<S: Send + 'static> StreamingChild<S> {
    /// Spawn `cmd` with stdout/stderr appended to `options.log_path`.
    #[instrument(skip_all, fields(log = %options.log_path.display(), echo = options.echo))]
    pub fn spawn<F>(mut cmd: Command, options: &StreamOptions, on_line: F) -> Result<Self>
    where
        F: Fn(&str, &Sender<S>) + Send + 'static,
    {
        if let Some(parent) = options.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&options.log_path)
            .with_context(|| format!("open log {}", options.log_path.display()))?;
        let stderr_log = log
            .try_clone()
            .with_context(|| format!("clone log handle {}", options.log_path.display()))?;

        let mut reader = File::open(&options.log_path)
            .with_context(|| format!("open log for tail {}", options.log_path.display()))?;
        reader
            .seek(SeekFrom::End(0))
            .with_context(|| format!("seek log {}", options.log_path.display()))?;

        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log));
        // Own process group: a terminal Ctrl-C stops the supervisor, not the agent.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!("spawning agent process");
        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn agent");
                return Err(e).context("spawn agent");
            }
        };

        let exited = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let tail_exited = exited.clone();
        let echo = options.echo;
        let tail = thread::spawn(move || tail_log(reader, &tail_exited, echo, &tx, on_line));

        Ok(Self {
            child,
            exited,
            tail: Some(tail),
            signals: rx,
        })
    }
}

impl<S> StreamingChild<S> {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking exit check. On exit the tail thread drains the rest of the log
    /// before this returns, so every line has been seen.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let status = self.child.try_wait().context("poll agent process")?;
        if status.is_some() {
            self.exited.store(true, Ordering::SeqCst);
            if let Some(handle) = self.tail.take()
                && handle.join().is_err()
            {
                warn!("log tail thread panicked");
            }
        }
        Ok(status)
    }

    /// Signals produced since the last call.
    pub fn drain(&self) -> Vec<S> {
        self.signals.try_iter().collect()
    }
}

fn tail_log<S, F>(file: File, exited: &AtomicBool, echo: bool, tx: &Sender<S>, on_line: F)
where
    F: Fn(&str, &Sender<S>),
{
    let mut reader = BufReader::new(file);
    let mut pending: Vec<u8> = Vec::new();
    loop {
        // Sample the flag before reading so a final write is never missed.
        let finished = exited.load(Ordering::SeqCst);
        match reader.read_until(b'\n', &mut pending) {
            Ok(_) if pending.ends_with(b"\n") => {
                emit_line(&pending, echo, tx, &on_line);
                pending.clear();
                continue;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(err = %err, "read agent log");
                return;
            }
        }
        if finished {
            if !pending.is_empty() {
                emit_line(&pending, echo, tx, &on_line);
            }
            return;
        }
        thread::sleep(TAIL_IDLE_SLEEP);
    }
}

fn emit_line<S, F>(raw: &[u8], echo: bool, tx: &Sender<S>, on_line: &F)
where
    F: Fn(&str, &Sender<S>),
{
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\n', '\r']);
    if echo {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
    on_line(line, tx);
}

/// Append a single line to a log file, creating parents as needed.
pub fn append_log_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_exit<S>(child: &mut StreamingChild<S>) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = child.try_wait().expect("try_wait") {
                return status;
            }
            assert!(Instant::now() < deadline, "child did not exit");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn captures_output_with_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2");
        let output = run_command_with_timeout(cmd, Duration::from_secs(5), 1024).expect("run");
        assert!(output.status.success());
        assert!(!output.timed_out);
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let output = run_command_with_timeout(cmd, Duration::from_millis(100), 1024).expect("run");
        assert!(output.timed_out);
    }

    #[test]
    fn tails_every_line_including_unterminated_last() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("agent.log");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo one; echo two >&2; printf three");

        let mut child = StreamingChild::spawn(
            cmd,
            &StreamOptions {
                log_path: log_path.clone(),
                echo: false,
            },
            |line, tx| {
                let _ = tx.send(line.to_string());
            },
        )
        .expect("spawn");
        let status = wait_exit(&mut child);
        assert!(status.success());

        let mut lines = child.drain();
        lines.sort();
        assert_eq!(lines, vec!["one", "three", "two"]);
        let contents = fs::read_to_string(&log_path).expect("read log");
        assert!(contents.contains("one\n"));
    }

    #[test]
    fn appended_log_only_tails_new_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("pass1.log");
        fs::write(&log_path, "old attempt line\n").expect("seed log");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo fresh; exit 3");
        let mut child = StreamingChild::spawn(
            cmd,
            &StreamOptions {
                log_path: log_path.clone(),
                echo: false,
            },
            |line, tx| {
                let _ = tx.send(line.to_string());
            },
        )
        .expect("spawn");
        let status = wait_exit(&mut child);
        assert_eq!(status.code(), Some(3));
        assert_eq!(child.drain(), vec!["fresh".to_string()]);
        let contents = fs::read_to_string(&log_path).expect("read log");
        assert_eq!(contents, "old attempt line\nfresh\n");
    }
}
