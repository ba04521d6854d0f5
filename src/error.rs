//! Errors raised by run supervision.
//!
//! Start-time failures are returned to the caller of `RunRegistry::request_run`.
//! Mid-run failures never surface here; they end up on the handle as a
//! [`crate::model::FailureReason`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to create output directory {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read process output: {0}")]
    StreamRead(#[from] std::io::Error),

    #[error("run was stopped")]
    Cancelled,

    #[error("tool exited with code {code}")]
    ExitStatus { code: i32 },

    #[error("too many concurrent runs (limit {limit})")]
    ConcurrencyLimit { limit: usize },

    #[error("invalid run request: {0}")]
    InvalidRequest(String),
}
