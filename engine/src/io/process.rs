//! Helpers for running child processes with timeouts and bounded output.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported for killed or signalled children.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// How long output readers may keep draining once the child has exited.
///
/// A descendant that escaped the process group can hold the pipes open; past
/// this point the output captured so far is returned.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output.
///
/// Only the trailing `output_limit_bytes` of each stream are kept; failures
/// usually report at the end.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_dropped: usize,
    pub stderr_dropped: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        self.status.code().unwrap_or(TIMEOUT_EXIT_CODE)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. The child leads its own
/// process group, and on timeout the whole group is killed so grandchildren
/// spawned by a shell cannot outlive the call.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        match child_stdin.write_all(input) {
            Ok(()) => {}
            // The child may exit without reading its input.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("child closed stdin early");
            }
            Err(e) => return Err(e).context("write stdin"),
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_reader = StreamReader::spawn(stdout, output_limit_bytes);
    let stderr_reader = StreamReader::spawn(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    let drain_deadline = Instant::now() + DRAIN_GRACE;
    let (stdout, stdout_dropped) = stdout_reader.finish(drain_deadline).context("collect stdout")?;
    let (stderr, stderr_dropped) = stderr_reader.finish(drain_deadline).context("collect stderr")?;

    if stdout_dropped > 0 || stderr_dropped > 0 {
        warn!(stdout_dropped, stderr_dropped, "output truncated");
    }

    let duration = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, duration_ms = duration.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_dropped,
        stderr_dropped,
        timed_out,
        duration,
    })
}

/// Kill the child's process group, falling back to the child alone.
fn kill_process_group(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(child.id() as i32);
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => return Ok(()),
            Err(errno) => debug!(%errno, "killpg failed; killing child only"),
        }
    }
    child.kill().context("kill command")
}

#[derive(Debug, Default)]
struct StreamTail {
    buf: VecDeque<u8>,
    dropped: usize,
}

/// Background reader keeping the tail of one output stream.
struct StreamReader {
    tail: Arc<Mutex<StreamTail>>,
    handle: thread::JoinHandle<Result<()>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let tail = Arc::new(Mutex::new(StreamTail::default()));
        let shared = Arc::clone(&tail);
        let handle = thread::spawn(move || read_stream_tail(reader, limit, &shared));
        Self { tail, handle }
    }

    /// Wait for the reader until `deadline`, then take whatever was captured.
    fn finish(self, deadline: Instant) -> Result<(Vec<u8>, usize)> {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.handle.is_finished() {
            match self.handle.join() {
                Ok(result) => result?,
                Err(_) => return Err(anyhow!("output reader thread panicked")),
            }
        } else {
            warn!("output pipe still held open after exit; returning captured output");
        }
        let mut tail = self
            .tail
            .lock()
            .map_err(|_| anyhow!("output buffer lock poisoned"))?;
        let dropped = tail.dropped;
        Ok((std::mem::take(&mut tail.buf).into_iter().collect(), dropped))
    }
}

/// Drain `reader` into `tail`, keeping only the last `limit` bytes.
fn read_stream_tail<R: Read>(mut reader: R, limit: usize, tail: &Mutex<StreamTail>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut tail = tail
            .lock()
            .map_err(|_| anyhow!("output buffer lock poisoned"))?;
        tail.buf.extend(&chunk[..n]);
        if tail.buf.len() > limit {
            let excess = tail.buf.len() - limit;
            tail.buf.drain(..excess);
            tail.dropped += excess;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_exit_code_and_streams() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert_eq!(out.exit_code(), 3);
        assert_eq!(out.stdout_text().trim(), "out");
        assert_eq!(out.stderr_text().trim(), "err");
        assert!(!out.timed_out);
    }

    #[test]
    fn passes_stdin_through() {
        let out = run_command_with_timeout(sh("cat"), Some(b"{\"a\":1}"), Duration::from_secs(10), 1024)
            .expect("run");
        assert_eq!(out.stdout_text(), "{\"a\":1}");
    }

    #[test]
    fn keeps_only_the_tail() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout_text(), "ghij");
        assert_eq!(out.stdout_dropped, 6);
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command_with_timeout(sh("exec sleep 5"), None, Duration::from_millis(100), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code(), TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn timeout_kills_processes_started_by_the_shell() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("echo before; sleep 6; true"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        let elapsed = started.elapsed();

        assert!(out.timed_out);
        assert_eq!(out.exit_code(), TIMEOUT_EXIT_CODE);
        assert!(elapsed < Duration::from_secs(3), "returned after {elapsed:?}");
        assert_eq!(out.stdout_text().trim(), "before");
    }

    #[test]
    fn background_holder_of_the_pipe_does_not_block_exit() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("echo done; (sleep 6 &) ; exit 0"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");

        assert!(!out.timed_out);
        assert_eq!(out.exit_code(), 0);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(out.stdout_text().trim(), "done");
    }
}
