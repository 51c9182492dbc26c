//! Child process plumbing shared by shell steps and the session driver.
//!
//! Pipes are always drained on their own threads so a chatty child never
//! blocks on a full pipe; only the first `limit` bytes of each stream are kept.
//!
//! Children run in their own process group so termination reaches everything
//! they started. A descendant that escapes the group can still hold a pipe
//! open, so reader threads are only waited on for a bounded time.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Grace period given to a timed-out shell command before it is killed.
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);
/// How long pipe readers may lag behind the exit of the process.
pub const PIPE_DRAIN: Duration = Duration::from_secs(1);

/// Bytes kept from one stream plus how many were thrown away.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub discarded: usize,
}

impl Captured {
    fn append_to(&self, out: &mut String, stream: &str) {
        let text = String::from_utf8_lossy(&self.bytes);
        if text.trim().is_empty() && self.discarded == 0 {
            return;
        }
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&text);
        if self.discarded > 0 {
            out.push_str(&format!("\n[{stream}: {} more bytes not shown]\n", self.discarded));
        }
    }
}

/// Result of [`run_bounded`].
#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub stdout: Captured,
    pub stderr: Captured,
}

impl Finished {
    /// stdout followed by stderr, with a note where output was cut.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        self.stdout.append_to(&mut out, "stdout");
        self.stderr.append_to(&mut out, "stderr");
        out
    }
}

/// Run `cmd` with no stdin, at most `timeout` of wall time and `limit` bytes
/// kept per stream. A command that outlives its timeout is terminated.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_bounded(mut cmd: Command, timeout: Duration, limit: usize) -> Result<Finished> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut cmd);
    let mut child = cmd.spawn().context("spawn command")?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
    let stdout = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr = thread::spawn(move || read_stream_limited(stderr, limit));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out");
            let (status, _) = terminate_gracefully(&mut child, TIMEOUT_GRACE)?;
            (status, true)
        }
    };

    let stdout = collect(stdout, "stdout");
    let stderr = collect(stderr, "stderr");
    debug!(code = ?status.code(), timed_out, "command exited");
    Ok(Finished {
        status,
        timed_out,
        stdout,
        stderr,
    })
}

fn collect(handle: JoinHandle<Result<(Vec<u8>, usize)>>, stream: &str) -> Captured {
    match join_output_within(handle, PIPE_DRAIN) {
        Ok((bytes, discarded)) => Captured { bytes, discarded },
        Err(err) => {
            warn!(stream, err = %format!("{err:#}"), "output not collected");
            Captured::default()
        }
    }
}

/// Wait up to `within` for a [`read_stream_limited`] thread. A reader still
/// blocked after that is left running and its output is lost.
pub fn join_output_within(
    handle: JoinHandle<Result<(Vec<u8>, usize)>>,
    within: Duration,
) -> Result<(Vec<u8>, usize)> {
    let deadline = Instant::now() + within;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            bail!("pipe still open {}ms after exit", within.as_millis());
        }
        thread::sleep(Duration::from_millis(10));
    }
    handle
        .join()
        .map_err(|_| anyhow!("pipe reader panicked"))?
}

/// Read `reader` to EOF keeping the first `limit` bytes. Returns the kept
/// bytes and the count of discarded ones.
pub fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut discarded = 0;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read pipe")?;
        if n == 0 {
            return Ok((kept, discarded));
        }
        let take = n.min(limit.saturating_sub(kept.len()));
        kept.extend_from_slice(&chunk[..take]);
        discarded += n - take;
    }
}

/// Make the spawned child the leader of a new process group.
#[cfg(unix)]
pub fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub fn own_process_group(_cmd: &mut Command) {}

/// Ask `child` and its process group to exit, then force-kill the group if
/// the child is still running after `grace`.
///
/// On unix the request is SIGTERM; elsewhere the child is killed immediately.
/// Group members left behind by a child that did exit are killed as well.
/// Returns the exit status and whether the kill was forced.
#[instrument(skip_all, fields(pid = child.id(), grace_ms = grace.as_millis() as u64))]
pub fn terminate_gracefully(child: &mut Child, grace: Duration) -> Result<(ExitStatus, bool)> {
    let pid = child.id();
    if let Some(status) = child.try_wait().context("poll child")? {
        signal_group(pid, "KILL");
        return Ok((status, false));
    }
    let asked = signal_group(pid, "TERM") || signal_process(pid, "TERM");
    if asked && let Some(status) = child.wait_timeout(grace).context("wait after SIGTERM")? {
        debug!("child exited after SIGTERM");
        signal_group(pid, "KILL");
        return Ok((status, false));
    }
    warn!("child still running, killing");
    signal_group(pid, "KILL");
    child.kill().context("kill child")?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}

/// Signal every process in the group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, sig: &str) -> bool {
    send_kill(&[&format!("-{sig}"), "--", &format!("-{pid}")])
}

#[cfg(unix)]
fn signal_process(pid: u32, sig: &str) -> bool {
    send_kill(&[&format!("-{sig}"), &pid.to_string()])
}

#[cfg(unix)]
fn send_kill(args: &[&str]) -> bool {
    let sent = Command::new("kill")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match sent {
        Ok(status) => status.success(),
        Err(err) => {
            warn!(err = %err, "could not run kill");
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _sig: &str) -> bool {
    false
}

#[cfg(not(unix))]
fn signal_process(_pid: u32, _sig: &str) -> bool {
    false
}
