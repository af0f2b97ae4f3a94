//! Helpers for running child processes with timeouts, cancellation, and bounded output.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// How often a running child is checked for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long readers may keep draining after the group was killed.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Wall-clock and memory bounds for one child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    /// Bytes retained per stream. The tail is kept; earlier bytes are dropped.
    pub output_limit_bytes: usize,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_dropped: usize,
    pub stderr_dropped: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, with a marker for dropped leading bytes.
    pub fn combined_lossy(&self) -> String {
        let mut buf = String::new();
        if self.stdout_dropped > 0 {
            buf.push_str(&format!("[stdout: {} earlier bytes dropped]\n", self.stdout_dropped));
        }
        buf.push_str(&self.stdout_lossy());
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            if self.stderr_dropped > 0 {
                buf.push_str(&format!("[stderr: {} earlier bytes dropped]\n", self.stderr_dropped));
            }
            buf.push_str(&self.stderr_lossy());
        }
        buf
    }

    /// Finished on its own (not killed) with exit code 0.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.success()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child runs in its own process group and output is read concurrently.
/// When the timeout expires or `cancel` fires the whole group is killed; both
/// are reported in the output, not as errors. Descendants that keep the pipes
/// open past the deadline are killed too, and whatever was captured is kept.
/// Spawn failures are errors.
#[instrument(skip_all, fields(timeout_ms = duration_ms(limits.timeout), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    own_process_group(&mut cmd);

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
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

    let limit = limits.output_limit_bytes;
    let (done_tx, done_rx) = mpsc::channel();
    let stdout_tail = spawn_reader(stdout, limit, done_tx.clone());
    let stderr_tail = spawn_reader(stderr, limit, done_tx);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Written off-thread so a child that never reads cannot block the deadline.
        thread::spawn(move || {
            // A child that exits without reading stdin closes the pipe; that is not our failure.
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let (status, mut timed_out, cancelled) = wait_bounded(&mut child, limits.timeout, cancel)?;

    let killed = timed_out || cancelled;
    let grace = Instant::now() + READER_GRACE;
    let drain_until = if killed {
        grace
    } else {
        started
            .checked_add(limits.timeout)
            .map_or(grace, |deadline| deadline.max(grace))
    };
    let pending = wait_for_readers(&done_rx, 2, drain_until);
    if pending > 0 {
        if killed {
            warn!("output readers still blocked after kill, keeping partial output");
        } else {
            warn!("descendants kept output open past the timeout, killing group");
            kill_group(&child);
            timed_out = true;
            wait_for_readers(&done_rx, pending, Instant::now() + READER_GRACE);
        }
    }

    let (stdout, stdout_dropped) = stdout_tail.snapshot();
    let (stderr, stderr_dropped) = stderr_tail.snapshot();

    if stdout_dropped > 0 || stderr_dropped > 0 {
        debug!(stdout_dropped, stderr_dropped, "output truncated to tail");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_dropped,
        stderr_dropped,
        timed_out,
        cancelled,
    })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn wait_bounded(
    child: &mut Child,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<(ExitStatus, bool, bool)> {
    let started = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            warn!(timeout_ms = duration_ms(timeout), "command timed out, killing");
            return Ok((kill_and_reap(child)?, true, false));
        }
        let slice = remaining.min(CANCEL_POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok((status, false, false));
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("command cancelled, killing");
            return Ok((kill_and_reap(child)?, false, true));
        }
    }
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    kill_group(child);
    if let Err(e) = child.kill() {
        // Already exited between the last poll and the kill.
        debug!(err = %e, "kill failed");
    }
    child.wait().context("wait command after kill")
}

/// Put the child in a fresh process group so descendants can be killed with it.
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

/// SIGKILL the child's process group. The group outlives a reaped leader while
/// any descendant is alive.
#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!(err = %e, pgid, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

/// Wait until `readers` streams reached EOF or `deadline` passed. Returns how many are still open.
fn wait_for_readers(done: &mpsc::Receiver<()>, readers: usize, deadline: Instant) -> usize {
    let mut pending = readers;
    while pending > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if done.recv_timeout(remaining).is_err() {
            break;
        }
        pending -= 1;
    }
    pending
}

/// Tail of one output stream, shared with its reader thread.
#[derive(Debug, Clone)]
struct StreamTail {
    inner: Arc<Mutex<TailBuf>>,
}

#[derive(Debug, Default)]
struct TailBuf {
    bytes: VecDeque<u8>,
    dropped: usize,
}

impl StreamTail {
    fn push(&self, chunk: &[u8], limit: usize) {
        let mut tail = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tail.bytes.extend(chunk);
        if tail.bytes.len() > limit {
            let excess = tail.bytes.len() - limit;
            tail.bytes.drain(..excess);
            tail.dropped += excess;
        }
    }

    /// Bytes kept so far and how many earlier bytes were dropped.
    fn snapshot(&self) -> (Vec<u8>, usize) {
        let tail = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (tail.bytes.iter().copied().collect(), tail.dropped)
    }
}

/// Drain `reader` on a thread, keeping only the last `limit` bytes. Signals `done` at EOF.
fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    limit: usize,
    done: mpsc::Sender<()>,
) -> StreamTail {
    let tail = StreamTail {
        inner: Arc::new(Mutex::new(TailBuf::default())),
    };
    let shared = tail.clone();
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => shared.push(&chunk[..n], limit),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(err = %e, "read output");
                    break;
                }
            }
        }
        let _ = done.send(());
    });
    tail
}

/// Long-lived side process killed when dropped.
#[derive(Debug)]
pub struct BackgroundProcess {
    child: Child,
}

impl BackgroundProcess {
    /// Spawn `cmd` detached from our stdio.
    pub fn spawn(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        own_process_group(&mut cmd);
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn background {:?}", cmd.get_program()))?;
        debug!(pid = child.id(), "background process started");
        Ok(Self { child })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            kill_group(&self.child);
            if let Err(e) = self.child.kill() {
                warn!(err = %e, pid = self.child.id(), "failed to kill background process");
            }
            let _ = self.child.wait();
        }
    }
}
