//! Helpers shared by unit tests: mock Overviewer executables and event collection.

use crate::model::{RunEvent, RunState};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Write an executable shell script standing in for Overviewer.
#[cfg(unix)]
pub fn mock_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(format!("{name}.sh"));
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write mock tool");
    let mut perms = std::fs::metadata(&path).expect("stat mock tool").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod mock tool");
    path
}

/// Collect output chunks for `id` until its `Finished` event arrives.
pub async fn collect_until_finished(
    rx: &mut UnboundedReceiver<RunEvent>,
    id: &str,
    within: Duration,
) -> (Vec<String>, RunState) {
    let mut chunks = Vec::new();
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let ev = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for run to finish")
            .expect("event channel closed");
        match ev {
            RunEvent::Output {
                id: ev_id, chunk, ..
            } if ev_id == id => chunks.push(chunk),
            RunEvent::Finished {
                id: ev_id, state, ..
            } if ev_id == id => return (chunks, state),
            _ => {}
        }
    }
}
