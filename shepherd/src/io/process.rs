//! Bounded child processes for the executor and planner collaborators.

use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    /// `None` when the child was killed after the deadline.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// First non-blank stdout line: collaborators answer with exactly one JSON line.
    pub fn first_line(&self) -> Option<String> {
        String::from_utf8_lossy(&self.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).trim().to_string();
        if self.stderr_truncated > 0 {
            text.push_str(&format!(" [stderr truncated {} bytes]", self.stderr_truncated));
        }
        text
    }

    pub fn exit_label(&self) -> String {
        match self.status.and_then(|status| status.code()) {
            Some(code) => format!("exit code {code}"),
            None if self.timed_out => "killed after timeout".to_string(),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Build a command from argv; the first element is the program.
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// How long readers may keep draining once the child has exited or been killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Run a command with one stdin payload and a wall-clock deadline.
///
/// The child runs in its own process group. stdin is written and stdout/stderr
/// are drained on helper threads, so neither a child that never reads nor a
/// chatty one can stall the caller; bytes beyond `output_limit_bytes` are
/// counted and discarded. On timeout the whole group is killed and `timed_out`
/// is set. Readers still blocked on a pipe held by an escaped descendant are
/// abandoned after a short grace period, so the call returns close to the
/// deadline either way.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_bounded(
    mut cmd: Command,
    stdin: &[u8],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    debug!("spawning child process");
    let started = Instant::now();
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
    let stdout_reader = OutputReader::spawn(stdout, output_limit_bytes, "stdout");
    let stderr_reader = OutputReader::spawn(stderr, output_limit_bytes, "stderr");

    // Closing stdin after the payload signals end of request. The writer is
    // never joined: a child that stops reading unblocks it by exiting.
    if let Some(mut child_stdin) = child.stdin.take() {
        let payload = stdin.to_vec();
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&payload) {
                warn!(err = %err, "child closed stdin before reading the request");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Some(status),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            kill_tree(&mut child);
            child.wait().ok();
            None
        }
    };

    let drain_deadline = (started + timeout).max(Instant::now() + DRAIN_GRACE);
    let stdout = stdout_reader.finish(drain_deadline);
    let stderr = stderr_reader.finish(drain_deadline);
    if (stdout.abandoned || stderr.abandoned) && !timed_out {
        // The child exited but a descendant still holds its output pipes.
        kill_tree(&mut child);
    }
    if stdout.truncated > 0 || stderr.truncated > 0 {
        warn!(
            stdout_truncated = stdout.truncated,
            stderr_truncated = stderr.truncated,
            "output truncated"
        );
    }

    debug!(
        exit_code = ?status.and_then(|s| s.code()),
        timed_out,
        elapsed_ms = started.elapsed().as_millis(),
        "command finished"
    );
    Ok(ProcessOutput {
        status,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        timed_out,
    })
}

/// Kill the child's process group, falling back to the child alone.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    match kill_process_group(child.id()) {
        Ok(()) => return,
        Err(err) => debug!(err = %err, "process group kill failed, killing child only"),
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "failed to kill command");
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::other(format!("pid {pid} out of range")))?;
    // SAFETY: kill(2) takes plain integers; the group id is the child's pid
    // because it was spawned with `process_group(0)`.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
    abandoned: bool,
}

/// Drains one output pipe on a background thread into a size-limited buffer.
struct OutputReader {
    captured: Arc<Mutex<Captured>>,
    done: Receiver<()>,
    stream: &'static str,
}

impl OutputReader {
    fn spawn<R: Read + Send + 'static>(mut reader: R, limit: usize, stream: &'static str) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let (done_tx, done) = mpsc::channel();
        let sink = Arc::clone(&captured);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                let n = match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        warn!(stream, err = %err, "read output failed");
                        break;
                    }
                };
                let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
                let keep = n.min(limit.saturating_sub(captured.bytes.len()));
                captured.bytes.extend_from_slice(&chunk[..keep]);
                captured.truncated += n - keep;
            }
            // Dropping the sender is the completion signal.
            drop(done_tx);
        });
        Self {
            captured,
            done,
            stream,
        }
    }

    /// Wait for EOF until `deadline`, then take whatever was read.
    fn finish(self, deadline: Instant) -> Captured {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let abandoned = matches!(
            self.done.recv_timeout(remaining),
            Err(RecvTimeoutError::Timeout)
        );
        if abandoned {
            warn!(stream = self.stream, "output pipe still open after exit, abandoning reader");
        }
        let mut captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
        Captured {
            bytes: std::mem::take(&mut captured.bytes),
            truncated: captured.truncated,
            abandoned,
        }
    }
}
