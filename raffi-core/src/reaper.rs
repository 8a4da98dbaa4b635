//! Orphan reaper: removes work directories whose session no longer exists.
//!
//! Sessions normally clean up through the explicit cleanup endpoint, but a
//! crashed client leaves its slice directories behind. The reaper sweeps
//! the shared temp area on an interval and deletes anything the controller
//! no longer tracks.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::config::sessions_temp_dir;
use crate::hls::SliceController;

/// Remove session directories not present in the controller.
pub fn cleanup_orphaned_sessions(controller: &SliceController) {
    let active: HashSet<String> = controller.session_ids().into_iter().collect();
    sweep_dir(&sessions_temp_dir(), &active);
}

fn sweep_dir(root: &Path, active: &HashSet<String>) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %root.display(), "failed to read temp directory: {e}");
            }
            return;
        }
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if active.contains(&name) {
            continue;
        }

        let path = entry.path();
        tracing::info!(session = %name, "removing orphaned session directory");
        if let Err(e) = std::fs::remove_dir_all(&path) {
            tracing::warn!(dir = %path.display(), "failed to remove orphaned directory: {e}");
        }
    }
}

/// Spawn the periodic reaper task.
pub fn spawn_reaper(controller: SliceController, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            cleanup_orphaned_sessions(&controller);
        }
    })
}
