//! Map name -> run bookkeeping. At most one entry per map.

use crate::engine::{RunHandle, RunSink, RunSupervisor};
use crate::error::RunError;
use crate::model::RunRequest;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RunRegistry {
    supervisor: RunSupervisor,
    runs: HashMap<String, RunHandle>,
    /// `None` means no cap on simultaneous Overviewer processes.
    max_concurrent: Option<usize>,
}

impl RunRegistry {
    pub fn new(supervisor: RunSupervisor, max_concurrent: Option<usize>) -> Self {
        Self {
            supervisor,
            runs: HashMap::new(),
            max_concurrent: max_concurrent.filter(|n| *n > 0),
        }
    }

    /// Start a run for `req.map`, or return the existing handle if that map is
    /// already running. A finished entry for the map is replaced only once the
    /// new process has actually started.
    pub fn request_run(
        &mut self,
        req: &RunRequest,
        sink: Arc<dyn RunSink>,
    ) -> Result<RunHandle, RunError> {
        if let Some(existing) = self.runs.get(&req.map) {
            if existing.is_running() {
                debug!(run = %req.map, "already running; reusing handle");
                return Ok(existing.clone());
            }
        }

        if let Some(limit) = self.max_concurrent {
            if self.active_count() >= limit {
                return Err(RunError::ConcurrencyLimit { limit });
            }
        }

        let handle = self.supervisor.start(req, sink)?;
        self.runs.insert(req.map.clone(), handle.clone());
        Ok(handle)
    }

    /// Request a stop and forget the run. The process dies asynchronously; the
    /// detached handle is returned so callers can still await it.
    pub fn stop_run(&mut self, id: &str) -> Option<RunHandle> {
        let handle = self.runs.remove(id)?;
        if self.supervisor.request_stop(&handle) {
            info!(run = id, "stop requested");
        }
        Some(handle)
    }

    /// Stop and detach every run.
    pub fn stop_all(&mut self) -> Vec<RunHandle> {
        let ids: Vec<String> = self.runs.keys().cloned().collect();
        ids.iter().filter_map(|id| self.stop_run(id)).collect()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.runs.get(id).is_some_and(RunHandle::is_running)
    }

    pub fn get(&self, id: &str) -> Option<&RunHandle> {
        self.runs.get(id)
    }

    pub fn active_count(&self) -> usize {
        self.runs.values().filter(|h| h.is_running()).count()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{FailureReason, RunEvent, RunState};
    use crate::test_support::{collect_until_finished, mock_tool};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(10);

    fn registry() -> RunRegistry {
        RunRegistry::new(RunSupervisor::default(), None)
    }

    fn sink() -> (Arc<dyn RunSink>, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(tx), rx)
    }

    #[tokio::test]
    async fn completed_run_reports_output_and_stops_counting_as_running() {
        let dir = tempfile::tempdir().unwrap();
        let tool = mock_tool(dir.path(), "ok", "printf 'rendering...\\n'\nexit 0\n");
        let mut reg = registry();
        let (sink, mut rx) = sink();

        let req = RunRequest::new("world1", &tool, dir.path().join("saves"), dir.path().join("out"));
        let handle = reg.request_run(&req, sink).unwrap();
        assert!(reg.is_running("world1"));

        let (chunks, state) = collect_until_finished(&mut rx, "world1", WAIT).await;
        assert_eq!(state, RunState::Completed(0));
        assert_eq!(chunks.concat(), "rendering...\n");
        assert_eq!(chunks.concat(), handle.output_text());
        assert!(!reg.is_running("world1"));
        // Finished entries stay until the caller stops tracking them.
        assert!(reg.get("world1").is_some());
    }

    #[tokio::test]
    async fn second_request_while_running_reuses_handle() {
        let dir = tempfile::tempdir().unwrap();
        let spawns = dir.path().join("spawns");
        let tool = mock_tool(
            dir.path(),
            "count",
            &format!("echo spawned >> '{}'\necho started\nexec sleep 600\n", spawns.display()),
        );
        let mut reg = registry();
        let (sink, mut rx) = sink();
        let req = RunRequest::new("world1", &tool, dir.path(), dir.path().join("out"));

        let first = reg.request_run(&req, sink.clone()).unwrap();
        let second = reg.request_run(&req, sink).unwrap();
        assert!(first.same_run(&second));
        assert_eq!(reg.active_count(), 1);

        // Let the tool get going before stopping it.
        loop {
            let ev = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if matches!(ev, RunEvent::Output { .. }) {
                break;
            }
        }
        reg.stop_run("world1");
        let (_, state) = collect_until_finished(&mut rx, "world1", WAIT).await;
        assert!(state.is_cancelled());
        // Only one process was ever spawned.
        let spawned = std::fs::read_to_string(&spawns).unwrap();
        assert_eq!(spawned.lines().count(), 1);
    }

    #[tokio::test]
    async fn stop_run_cancels_and_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let tool = mock_tool(dir.path(), "sleepy", "exec sleep 600\n");
        let mut reg = registry();
        let (sink, _rx) = sink();
        let req = RunRequest::new("world2", &tool, dir.path(), dir.path().join("out"));

        reg.request_run(&req, sink).unwrap();
        let detached = reg.stop_run("world2").expect("entry existed");
        assert!(!reg.is_running("world2"));
        assert!(reg.get("world2").is_none());

        let state = tokio::time::timeout(WAIT, detached.wait()).await.unwrap();
        assert_eq!(state, RunState::Failed(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn spawn_failure_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry();
        let (sink, _rx) = sink();
        let req = RunRequest::new("world3", "/does/not/exist", dir.path(), dir.path().join("out"));

        let err = reg.request_run(&req, sink).unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
        assert!(!reg.is_running("world3"));
        assert!(reg.get("world3").is_none());
    }

    #[tokio::test]
    async fn finished_entry_is_replaced_by_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let tool = mock_tool(dir.path(), "ok", "exit 0\n");
        let mut reg = registry();
        let (sink, _rx) = sink();
        let req = RunRequest::new("world1", &tool, dir.path(), dir.path().join("out"));

        let first = reg.request_run(&req, sink.clone()).unwrap();
        tokio::time::timeout(WAIT, first.wait()).await.unwrap();
        let second = reg.request_run(&req, sink).unwrap();
        assert!(!first.same_run(&second));
        assert!(reg.get("world1").unwrap().same_run(&second));
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_extra_maps() {
        let dir = tempfile::tempdir().unwrap();
        let tool = mock_tool(dir.path(), "sleepy", "exec sleep 600\n");
        let mut reg = RunRegistry::new(RunSupervisor::default(), Some(1));
        let (sink, _rx) = sink();

        let a = RunRequest::new("a", &tool, dir.path(), dir.path().join("out"));
        let b = RunRequest::new("b", &tool, dir.path(), dir.path().join("out"));
        reg.request_run(&a, sink.clone()).unwrap();
        let err = reg.request_run(&b, sink.clone()).unwrap_err();
        assert!(matches!(err, RunError::ConcurrencyLimit { limit: 1 }));
        // Re-requesting the running map is still fine.
        assert!(reg.request_run(&a, sink).is_ok());

        for handle in reg.stop_all() {
            tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
        }
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn stop_unknown_id_is_a_no_op() {
        let mut reg = registry();
        assert!(reg.stop_run("nope").is_none());
        assert!(!reg.is_running("nope"));
    }
}
