use crate::error::RunError;
use std::path::PathBuf;
use std::time::Duration;

/// `42s`, `3m05s`, `1h02m`.
pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// What the caller asks for: render `map` from `saves_root` into `output_root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub map: String,
    pub executable: PathBuf,
    pub saves_root: PathBuf,
    pub output_root: PathBuf,
}

impl RunRequest {
    pub fn new(
        map: impl Into<String>,
        executable: impl Into<PathBuf>,
        saves_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            map: map.into(),
            executable: executable.into(),
            saves_root: saves_root.into(),
            output_root: output_root.into(),
        }
    }
}

/// Why a run ended without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The tool exited on its own with a non-zero code.
    ExitCode(i32),
    /// The run was stopped by an explicit stop request.
    Cancelled,
    /// Reading the tool's output failed.
    StreamRead(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Cancelling,
    Completed(i32),
    Failed(FailureReason),
}

impl RunState {
    /// `Starting` or `Running`. A run that is being cancelled no longer counts.
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Starting | RunState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed(_) | RunState::Failed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunState::Failed(FailureReason::Cancelled))
    }

    /// Terminal outcome as a `Result`: the exit code on success, the failure otherwise.
    /// `None` while the run has not finished.
    pub fn outcome(&self) -> Option<Result<i32, RunError>> {
        match self {
            RunState::Completed(code) => Some(Ok(*code)),
            RunState::Failed(FailureReason::ExitCode(code)) => {
                Some(Err(RunError::ExitStatus { code: *code }))
            }
            RunState::Failed(FailureReason::Cancelled) => Some(Err(RunError::Cancelled)),
            RunState::Failed(FailureReason::StreamRead(msg)) => Some(Err(RunError::StreamRead(
                std::io::Error::other(msg.clone()),
            ))),
            _ => None,
        }
    }

    /// Short human-readable status for status bars and summaries.
    pub fn describe(&self) -> String {
        match self {
            RunState::Starting => "Starting".into(),
            RunState::Running => "Running".into(),
            RunState::Cancelling => "Stopping".into(),
            RunState::Completed(_) => "Completed".into(),
            RunState::Failed(FailureReason::ExitCode(code)) => {
                format!("Completed with errors (exit {code})")
            }
            RunState::Failed(FailureReason::Cancelled) => "Stopped by user".into(),
            RunState::Failed(FailureReason::StreamRead(msg)) => format!("Failed: {msg}"),
        }
    }
}

/// Events emitted by supervisors and the controller, consumed by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The controller accepted a start request. `serial` names the run the
    /// request resolved to, so a tab can tell its own events from a predecessor's.
    Started {
        id: String,
        serial: u64,
        /// True when an already active run was re-surfaced instead of spawned.
        reused: bool,
    },
    StartFailed {
        id: String,
        message: String,
    },
    Output {
        id: String,
        serial: u64,
        chunk: String,
    },
    /// Non-terminal transitions (`Running`, `Cancelling`).
    StateChanged {
        id: String,
        serial: u64,
        state: RunState,
    },
    Finished {
        id: String,
        serial: u64,
        state: RunState,
    },
    /// Full output of a run, read from its handle for an export.
    OutputExport {
        id: String,
        serial: u64,
        target: ExportTarget,
        text: String,
    },
    Info(InfoEvent),
}

impl RunEvent {
    /// Map a run event belongs to; `None` for controller info.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            RunEvent::Started { id, .. }
            | RunEvent::StartFailed { id, .. }
            | RunEvent::Output { id, .. }
            | RunEvent::StateChanged { id, .. }
            | RunEvent::Finished { id, .. }
            | RunEvent::OutputExport { id, .. } => Some(id),
            RunEvent::Info(_) => None,
        }
    }
}

/// Where an exported run log goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTarget {
    Clipboard,
    LogFile,
}

/// Structured info events emitted by the controller.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    StopRequested { id: String },
    StillStopping { remaining: usize },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::StopRequested { id } => format!("Stopping {id}…"),
            InfoEvent::StillStopping { remaining } => {
                format!("Still stopping {remaining} run(s)…")
            }
        }
    }
}
