//! Run supervision: spawn one Overviewer process, relay its output, stop it on request.

mod command;
mod handle;
mod relay;

pub use command::RunCommand;
pub use handle::RunHandle;

use crate::error::RunError;
use crate::model::{RunEvent, RunRequest, RunState};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Default bound on each wait for a killed process to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives a run's output and lifecycle changes as they happen.
///
/// Called from the run's relay task, so implementations must not block.
pub trait RunSink: Send + Sync + 'static {
    fn on_output(&self, run: &RunHandle, chunk: &str);

    fn on_state(&self, _run: &RunHandle, _state: &RunState) {}

    fn on_finished(&self, run: &RunHandle, state: &RunState);
}

/// UI layers drain this channel on their own thread; sends never block.
impl RunSink for mpsc::UnboundedSender<RunEvent> {
    fn on_output(&self, run: &RunHandle, chunk: &str) {
        let _ = self.send(RunEvent::Output {
            id: run.id().to_owned(),
            serial: run.serial(),
            chunk: chunk.to_owned(),
        });
    }

    fn on_state(&self, run: &RunHandle, state: &RunState) {
        let _ = self.send(RunEvent::StateChanged {
            id: run.id().to_owned(),
            serial: run.serial(),
            state: state.clone(),
        });
    }

    fn on_finished(&self, run: &RunHandle, state: &RunState) {
        let _ = self.send(RunEvent::Finished {
            id: run.id().to_owned(),
            serial: run.serial(),
            state: state.clone(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct RunSupervisor {
    stop_timeout: Duration,
}

impl Default for RunSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_TIMEOUT)
    }
}

impl RunSupervisor {
    pub fn new(stop_timeout: Duration) -> Self {
        Self { stop_timeout }
    }

    /// Prepare the output directory, spawn the tool and start relaying its output.
    ///
    /// Must be called from within a Tokio runtime. Errors are returned before any
    /// process exists; the returned handle is already `Running`.
    pub fn start(&self, req: &RunRequest, sink: Arc<dyn RunSink>) -> Result<RunHandle, RunError> {
        let command = RunCommand::from_request(req)?;
        ensure_output_dir(&command)?;

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let handle = RunHandle::new(req.map.clone(), command);
        let child = cmd.spawn().map_err(|source| {
            warn!(run = %req.map, error = %source, "failed to launch Overviewer");
            RunError::Spawn {
                program: handle.command().program.to_string_lossy().into_owned(),
                source,
            }
        })?;

        info!(
            run = %req.map,
            pid = ?child.id(),
            command = %handle.command().display(),
            "run started"
        );
        handle.set_state(RunState::Running);
        // First event of every run.
        sink.on_state(&handle, &RunState::Running);
        tokio::spawn(relay::run(handle.clone(), child, sink, self.stop_timeout));
        Ok(handle)
    }

    /// Cooperative stop: the relay notices the flag and kills the process.
    pub fn request_stop(&self, handle: &RunHandle) -> bool {
        handle.request_stop()
    }
}

fn ensure_output_dir(command: &RunCommand) -> Result<(), RunError> {
    let dir = &command.output_dir;
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|source| RunError::OutputDirectory {
        path: dir.clone(),
        source,
    })
}
