use super::command::RunCommand;
use crate::model::RunState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;

/// Mutable part of a run. State and the stop flag live under one lock so the relay
/// and callers of `request_stop` / `is_running` always see a consistent pair.
#[derive(Debug)]
struct RunCell {
    state: RunState,
    stop_requested: bool,
    output: Vec<String>,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Shared {
    id: String,
    serial: u64,
    command: RunCommand,
    started_at: Instant,
    cell: Mutex<RunCell>,
    // Wakes the relay when a stop is requested while it is parked on a read.
    stop_signal: Notify,
    // Wakes `wait()` callers once a terminal state is stored.
    finished: Notify,
}

/// Shared reference to one run. Cloning is cheap; all clones observe the same run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    inner: Arc<Shared>,
}

impl RunHandle {
    pub(crate) fn new(id: String, command: RunCommand) -> Self {
        Self {
            inner: Arc::new(Shared {
                id,
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                command,
                started_at: Instant::now(),
                cell: Mutex::new(RunCell {
                    state: RunState::Starting,
                    stop_requested: false,
                    output: Vec::new(),
                }),
                stop_signal: Notify::new(),
                finished: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Process-wide unique number; tells apart successive runs of the same map.
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn command(&self) -> &RunCommand {
        &self.inner.command
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    pub fn state(&self) -> RunState {
        self.lock().state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().state.is_active()
    }

    pub fn stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// Point-in-time copy of every chunk relayed so far, in arrival order.
    pub fn output_snapshot(&self) -> Vec<String> {
        self.lock().output.clone()
    }

    /// The snapshot joined into one string.
    pub fn output_text(&self) -> String {
        self.output_snapshot().concat()
    }

    /// True if both handles refer to the same run.
    pub fn same_run(&self, other: &RunHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Ask the relay to stop the process. Returns false if the run already finished.
    pub fn request_stop(&self) -> bool {
        let accepted = {
            let mut cell = self.lock();
            if cell.state.is_terminal() {
                false
            } else {
                cell.stop_requested = true;
                true
            }
        };
        if accepted {
            // notify_one stores a permit, so a relay that is between checks still sees it.
            self.inner.stop_signal.notify_one();
        }
        accepted
    }

    /// Resolve once the run reaches a terminal state.
    pub async fn wait(&self) -> RunState {
        loop {
            let notified = self.inner.finished.notified();
            {
                let cell = self.lock();
                if cell.state.is_terminal() {
                    return cell.state.clone();
                }
            }
            notified.await;
        }
    }

    pub(crate) async fn stop_signalled(&self) {
        self.inner.stop_signal.notified().await
    }

    pub(crate) fn set_state(&self, state: RunState) {
        let terminal = state.is_terminal();
        self.lock().state = state;
        if terminal {
            self.inner.finished.notify_waiters();
        }
    }

    /// Move to `Cancelling` unless the run already finished.
    pub(crate) fn mark_cancelling(&self) {
        let mut cell = self.lock();
        if !cell.state.is_terminal() {
            cell.state = RunState::Cancelling;
        }
    }

    pub(crate) fn append_output(&self, chunk: &str) {
        self.lock().output.push(chunk.to_owned());
    }

    fn lock(&self) -> MutexGuard<'_, RunCell> {
        // A panic while holding the lock cannot leave the cell half-written, so keep going.
        self.inner
            .cell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
