//! Output relay: the single background task that owns a run's child process.

use super::handle::RunHandle;
use super::RunSink;
use crate::error::RunError;
use crate::model::{FailureReason, RunState};
use std::future::Future;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tracing::{debug, error, info, warn};

pub(crate) const CHUNK_SIZE: usize = 8192;

/// After the process exits, keep reading whatever is still buffered in the pipes
/// for at most this long. A grandchild holding the pipe open must not stall the run.
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// Forced termination is attempted this many times, each followed by a bounded wait.
const KILL_ATTEMPTS: u32 = 2;

/// Decodes a byte stream into UTF-8 text chunks without ever splitting a
/// multi-byte character across chunks. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.pending[..valid]) {
                        out.push_str(text);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end: wait for the next read.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush bytes left over at end of stream.
    pub(crate) fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// What the relay needs from a child process once its pipes are taken.
pub(crate) trait Process {
    fn start_kill(&mut self) -> std::io::Result<()>;

    fn wait(&mut self) -> impl Future<Output = std::io::Result<ExitStatus>> + Send;
}

impl Process for Child {
    fn start_kill(&mut self) -> std::io::Result<()> {
        Child::start_kill(self)
    }

    fn wait(&mut self) -> impl Future<Output = std::io::Result<ExitStatus>> + Send {
        Child::wait(self)
    }
}

/// How the read loop ended.
enum LoopEnd {
    /// Both streams reached EOF.
    Eof,
    /// The process exited; pipes were drained.
    Exited(ExitStatus),
    StopRequested,
    ReadFailed(std::io::Error),
}

struct Relay {
    handle: RunHandle,
    sink: Arc<dyn RunSink>,
    stop_timeout: Duration,
}

pub(crate) async fn run(
    handle: RunHandle,
    child: Child,
    sink: Arc<dyn RunSink>,
    stop_timeout: Duration,
) {
    let relay = Relay {
        handle,
        sink,
        stop_timeout,
    };
    let state = relay.supervise(child).await;
    relay.finish(state);
}

impl Relay {
    async fn supervise(&self, mut child: Child) -> RunState {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.supervise_streams(&mut child, stdout, stderr).await
    }

    async fn supervise_streams<P, O, E>(
        &self,
        child: &mut P,
        stdout: Option<O>,
        stderr: Option<E>,
    ) -> RunState
    where
        P: Process,
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let end = self.relay_output(child, stdout, stderr).await;
        let id = self.handle.id();

        match end {
            LoopEnd::StopRequested => self.cancel(child).await,
            LoopEnd::ReadFailed(e) => {
                let err = RunError::from(e);
                warn!(run = id, error = %err, "output relay failed; terminating process");
                // Nobody reads the pipes any more; the tool would block once they fill up.
                let _ = self.terminate(child).await;
                if self.handle.stop_requested() {
                    RunState::Failed(FailureReason::Cancelled)
                } else {
                    RunState::Failed(FailureReason::StreamRead(err.to_string()))
                }
            }
            LoopEnd::Exited(status) => self.exit_state(status),
            LoopEnd::Eof => {
                // Streams closed; the process normally exits right after.
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => self.exit_state(status),
                        Err(e) => {
                            warn!(run = id, error = %e, "waiting for process failed");
                            RunState::Failed(FailureReason::StreamRead(e.to_string()))
                        }
                    },
                    _ = self.wait_for_stop() => self.cancel(child).await,
                }
            }
        }
    }

    async fn relay_output<P, O, E>(
        &self,
        child: &mut P,
        mut stdout: Option<O>,
        mut stderr: Option<E>,
    ) -> LoopEnd
    where
        P: Process,
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let mut out_buf = vec![0u8; CHUNK_SIZE];
        let mut err_buf = vec![0u8; CHUNK_SIZE];
        let mut out_text = Utf8Chunker::default();
        let mut err_text = Utf8Chunker::default();

        let exit_status = loop {
            if self.handle.stop_requested() {
                return LoopEnd::StopRequested;
            }
            if stdout.is_none() && stderr.is_none() {
                return LoopEnd::Eof;
            }
            tokio::select! {
                biased;
                // Only wakes the loop; the flag itself is read at the top.
                _ = self.handle.stop_signalled() => {}
                res = read_chunk(&mut stdout, &mut out_buf) => match res {
                    Ok(0) => {
                        self.deliver(&out_text.finish());
                        stdout = None;
                    }
                    Ok(n) => self.deliver(&out_text.push(&out_buf[..n])),
                    Err(e) => return LoopEnd::ReadFailed(e),
                },
                res = read_chunk(&mut stderr, &mut err_buf) => match res {
                    Ok(0) => {
                        self.deliver(&err_text.finish());
                        stderr = None;
                    }
                    Ok(n) => self.deliver(&err_text.push(&err_buf[..n])),
                    Err(e) => return LoopEnd::ReadFailed(e),
                },
                status = child.wait() => match status {
                    Ok(status) => break status,
                    Err(e) => return LoopEnd::ReadFailed(e),
                },
            }
        };

        // Process is gone: pick up output still sitting in the pipes.
        let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
        while stdout.is_some() || stderr.is_some() {
            if self.handle.stop_requested() {
                break;
            }
            let read = tokio::time::timeout_at(deadline, async {
                tokio::select! {
                    res = read_chunk(&mut stdout, &mut out_buf) => (true, res),
                    res = read_chunk(&mut stderr, &mut err_buf) => (false, res),
                }
            })
            .await;
            match read {
                Err(_) => {
                    debug!(run = self.handle.id(), "pipes still open after exit; not waiting");
                    break;
                }
                Ok((is_out, Ok(0))) => {
                    if is_out {
                        self.deliver(&out_text.finish());
                        stdout = None;
                    } else {
                        self.deliver(&err_text.finish());
                        stderr = None;
                    }
                }
                Ok((true, Ok(n))) => self.deliver(&out_text.push(&out_buf[..n])),
                Ok((false, Ok(n))) => self.deliver(&err_text.push(&err_buf[..n])),
                Ok((_, Err(e))) => return LoopEnd::ReadFailed(e),
            }
        }
        self.deliver(&out_text.finish());
        self.deliver(&err_text.finish());

        LoopEnd::Exited(exit_status)
    }

    /// Append to the handle's buffer first, then hand the same chunk to the sink.
    fn deliver(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.handle.append_output(chunk);
        self.sink.on_output(&self.handle, chunk);
    }

    fn exit_state(&self, status: ExitStatus) -> RunState {
        if self.handle.stop_requested() {
            return RunState::Failed(FailureReason::Cancelled);
        }
        // Killed by a signal: there is no exit code to report.
        match status.code().unwrap_or(-1) {
            0 => RunState::Completed(0),
            code => RunState::Failed(FailureReason::ExitCode(code)),
        }
    }

    async fn wait_for_stop(&self) {
        loop {
            if self.handle.stop_requested() {
                return;
            }
            self.handle.stop_signalled().await;
        }
    }

    async fn cancel<P: Process>(&self, child: &mut P) -> RunState {
        info!(run = self.handle.id(), "stop requested; terminating process");
        self.handle.mark_cancelling();
        self.sink.on_state(&self.handle, &RunState::Cancelling);
        let _ = self.terminate(child).await;
        RunState::Failed(FailureReason::Cancelled)
    }

    /// Kill the process and wait a bounded time for it to exit. A second kill is
    /// attempted once; after that the process is left behind and logged.
    async fn terminate<P: Process>(&self, child: &mut P) -> Option<ExitStatus> {
        let id = self.handle.id();
        for attempt in 1..=KILL_ATTEMPTS {
            if let Err(e) = child.start_kill() {
                debug!(run = id, error = %e, "kill failed; process may already have exited");
            }
            match tokio::time::timeout(self.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(run = id, ?status, "process terminated");
                    return Some(status);
                }
                Ok(Err(e)) => {
                    warn!(run = id, error = %e, "waiting for terminated process failed");
                    return None;
                }
                Err(_) => {
                    warn!(
                        run = id,
                        attempt,
                        timeout = ?self.stop_timeout,
                        "process did not exit after kill"
                    );
                }
            }
        }
        error!(run = id, "giving up on process; it may still be running");
        None
    }

    fn finish(&self, state: RunState) {
        let id = self.handle.id();
        match &state {
            RunState::Completed(_) => info!(run = id, "run completed"),
            RunState::Failed(reason) => info!(run = id, ?reason, "run failed"),
            _ => {}
        }
        self.handle.set_state(state.clone());
        self.sink.on_finished(&self.handle, &state);
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => futures::future::pending().await,
    }
}
