//! Child process execution with a wall-clock limit and bounded output.
//!
//! Shared by the validation command, the work command behind `drive` and the
//! command-backed refine producers.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How often a running child is checked for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// How long pipe readers may outlive the child. A descendant that inherited
/// the pipes keeps them open after the child itself is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Cancellation flag shared between a caller and a running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captured output of a finished (or killed) child.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout and stderr in one log document, cut at `limit` bytes.
    pub fn render_log(&self, limit: usize) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        if self.timed_out {
            buf.push_str("\n[command timed out]\n");
        }
        if self.cancelled {
            buf.push_str("\n[command cancelled]\n");
        }
        truncate_log(buf, limit)
    }
}

/// Build a `Command` from an argv-style list.
pub fn command_from_argv(argv: &[String], workdir: &Path) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir);
    Ok(cmd)
}

/// Run `cmd`, feeding `stdin` when given, and kill it after `timeout`.
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_command_cancellable(cmd, stdin, timeout, output_limit_bytes, &CancelToken::new())
}

/// Like [`run_command_with_timeout`], but also kills the child as soon as
/// `cancel` fires.
///
/// Stdin is written and both pipes are drained on their own threads while
/// the child runs, so neither a child that ignores its input nor a chatty one
/// can stall the timeout. Bytes past `output_limit_bytes` are counted and
/// dropped.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_cancellable(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Not joined: the pipe breaks once the child is gone.
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&input) {
                warn!(err = %err, "child did not consume stdin");
            }
        });
    }

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            break kill_and_reap(&mut child)?;
        }
        if cancel.is_cancelled() {
            warn!("command cancelled, killing");
            cancelled = true;
            break kill_and_reap(&mut child)?;
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(CANCEL_POLL))
            .context("wait for command")?
        {
            break status;
        }
    };

    let readers_deadline = Instant::now() + READER_GRACE;
    let (stdout, stdout_truncated) =
        collect_output(&stdout_rx, readers_deadline).context("collect stdout")?;
    let (stderr, stderr_truncated) =
        collect_output(&stderr_rx, readers_deadline).context("collect stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

/// Write a command log, creating the parent directory.
pub fn write_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write log {}", path.display()))
}

fn truncate_log(buf: String, limit: usize) -> String {
    if buf.len() <= limit {
        return buf;
    }
    let mut cut = limit;
    while !buf.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut)
}

type ReaderResult = Result<(Vec<u8>, usize)>;

fn spawn_reader<R>(reader: R, limit: usize) -> mpsc::Receiver<ReaderResult>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// Output of one reader, or nothing when a descendant still holds the pipe
/// open at `deadline`.
fn collect_output(rx: &mpsc::Receiver<ReaderResult>, deadline: Instant) -> ReaderResult {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!("output pipe still held open by a descendant, dropping its output");
            Ok((Vec::new(), 0))
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_from_stdin() {
        let output = run_command_with_timeout(
            sh("cat"),
            Some(b"{\"ok\":true}"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(output.succeeded());
        assert_eq!(output.stdout_text(), "{\"ok\":true}");
    }

    #[test]
    fn slow_command_is_killed() {
        let output =
            run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(100), 1024)
                .expect("run");
        assert!(output.timed_out);
        assert!(!output.succeeded());
        assert!(output.render_log(1024).contains("[command timed out]"));
    }

    #[test]
    fn output_beyond_limit_is_counted() {
        let output =
            run_command_with_timeout(sh("printf 0123456789"), None, Duration::from_secs(10), 4)
                .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[test]
    fn child_ignoring_large_stdin_still_times_out() {
        let input = vec![b'x'; 1024 * 1024];
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 5"),
            Some(&input),
            Duration::from_millis(300),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn grandchild_holding_pipes_does_not_block_return() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 8; echo done"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[test]
    fn cancelled_command_is_killed() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let started = Instant::now();
        let output =
            run_command_cancellable(sh("sleep 5"), None, Duration::from_secs(30), 1024, &cancel)
                .expect("run");
        canceller.join().expect("canceller");
        assert!(output.cancelled);
        assert!(!output.timed_out);
        assert!(!output.succeeded());
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(output.render_log(1024).contains("[command cancelled]"));
    }

    #[test]
    fn long_log_is_truncated() {
        let log = truncate_log("abcdef".to_string(), 3);
        assert_eq!(log, "abc\n[truncated 3 bytes]\n");
    }
}
