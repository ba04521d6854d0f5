//! Run lifecycle controller.
//!
//! Owns the run registry, turns UI commands into start/stop calls and emits events for
//! presentation layers. All registry access happens on this task.

use super::registry::RunRegistry;
use crate::engine::{RunHandle, RunSink};
use crate::model::{ExportTarget, InfoEvent, RunEvent, RunRequest};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// How long quit waits for stopped runs before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(12);

/// Commands emitted by UI layers to control runs.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    StartRun(RunRequest),
    StopRun(String),
    /// Read the full output of run `serial` of map `id` from its handle.
    ExportOutput {
        id: String,
        serial: u64,
        target: ExportTarget,
    },
    Quit,
}

fn start_run(
    registry: &mut RunRegistry,
    req: &RunRequest,
    event_tx: &UnboundedSender<RunEvent>,
) -> Option<RunHandle> {
    let reused = registry.is_running(&req.map);
    let sink: Arc<dyn RunSink> = Arc::new(event_tx.clone());
    match registry.request_run(req, sink) {
        Ok(handle) => {
            let _ = event_tx.send(RunEvent::Started {
                id: req.map.clone(),
                serial: handle.serial(),
                reused,
            });
            Some(handle)
        }
        Err(e) => {
            warn!(run = %req.map, error = %e, "run could not be started");
            let _ = event_tx.send(RunEvent::StartFailed {
                id: req.map.clone(),
                message: e.to_string(),
            });
            None
        }
    }
}

fn export_output(
    last_runs: &HashMap<String, RunHandle>,
    id: String,
    serial: u64,
    target: ExportTarget,
    event_tx: &UnboundedSender<RunEvent>,
) {
    let ev = match last_runs.get(&id).filter(|h| h.serial() == serial) {
        Some(handle) => RunEvent::OutputExport {
            id,
            serial,
            target,
            text: handle.output_text(),
        },
        None => {
            debug!(run = %id, serial, "export for unknown run");
            RunEvent::Info(InfoEvent::Message(format!("Output of {id} is no longer available")))
        }
    };
    let _ = event_tx.send(ev);
}

/// Orchestrate runs based on UI commands and emit events back to presentation layers.
pub(crate) async fn run_controller(
    mut registry: RunRegistry,
    event_tx: UnboundedSender<RunEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    // Latest run per map, kept after the registry detaches it so its log can
    // still be exported from a tab that stays open.
    let mut last_runs: HashMap<String, RunHandle> = HashMap::new();
    loop {
        match cmd_rx.recv().await {
            Some(UiCommand::StartRun(req)) => {
                if let Some(handle) = start_run(&mut registry, &req, &event_tx) {
                    last_runs.insert(req.map, handle);
                }
            }
            Some(UiCommand::StopRun(id)) => match registry.stop_run(&id) {
                Some(handle) if !handle.state().is_terminal() => {
                    let _ = event_tx.send(RunEvent::Info(InfoEvent::StopRequested { id }));
                }
                Some(_) => debug!(run = %id, "finished run detached"),
                None => debug!(run = %id, "stop for unknown run ignored"),
            },
            Some(UiCommand::ExportOutput { id, serial, target }) => {
                export_output(&last_runs, id, serial, target, &event_tx)
            }
            Some(UiCommand::Quit) | None => break,
        }
    }

    let stopping = registry.stop_all();
    if !stopping.is_empty() {
        info!(count = stopping.len(), "stopping runs before exit");
        let _ = event_tx.send(RunEvent::Info(InfoEvent::Message(format!(
            "Stopping {} run(s)…",
            stopping.len()
        ))));
    }
    wait_for_runs(stopping, &event_tx).await;
    Ok(())
}

/// Wait for detached runs to finish, bounded by [`SHUTDOWN_GRACE`].
pub(crate) async fn wait_for_runs(handles: Vec<RunHandle>, event_tx: &UnboundedSender<RunEvent>) {
    if handles.is_empty() {
        return;
    }
    let all_done = futures::future::join_all(handles.iter().map(|h| h.wait()));
    tokio::pin!(all_done);
    // If stopping stalls, keep the user informed.
    let mut watchdog = tokio::time::interval(Duration::from_secs(3));
    watchdog.tick().await;
    let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut all_done => return,
            _ = watchdog.tick() => {
                let remaining = handles.iter().filter(|h| !h.state().is_terminal()).count();
                let _ = event_tx.send(RunEvent::Info(InfoEvent::StillStopping { remaining }));
            }
            _ = &mut deadline => {
                warn!("runs did not stop within the shutdown grace period");
                return;
            }
        }
    }
}
