use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{error, info};

/// Prefix of every per-request download directory.
pub const JOB_DIR_PREFIX: &str = "yt-video-";

const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Removes a folder and all its contents (blocking). Never fails; errors are
/// logged.
pub fn cleanup_folder(path: &Path) {
    info!("Cleaning up temporary directory {}", path.display());
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(path) {
        error!("Failed to clean up directory {}: {e}", path.display());
    }
}

/// Removes `yt-video-*` folders under `base_dir` whose mtime is older than
/// `max_age`. Anything else in `base_dir` is left alone. Returns the number of
/// folders removed.
pub fn sweep_stale_jobs(base_dir: &Path, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(base_dir) {
        Ok(e) => e,
        Err(e) => {
            error!("Error scanning directory {}: {e}", base_dir.display());
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0usize;

    for entry in entries.flatten() {
        let is_job = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(JOB_DIR_PREFIX));
        let path = entry.path();
        if !is_job || !path.is_dir() {
            continue;
        }

        let age = match entry.metadata().and_then(|m| m.modified()) {
            Ok(mtime) => now.duration_since(mtime).unwrap_or_default(),
            Err(_) => continue,
        };

        if age > max_age {
            match std::fs::remove_dir_all(&path) {
                Ok(_) => {
                    removed += 1;
                    info!("Removed stale job folder: {} (age: {}s)", path.display(), age.as_secs());
                }
                Err(e) => error!("Error removing folder {}: {e}", path.display()),
            }
        }
    }

    removed
}

/// Spawns the background sweeper. Call this once at startup.
pub fn spawn_sweeper(base_dir: PathBuf, max_age: Duration) {
    tokio::spawn(async move {
        info!("Initializing stale job sweep for: {}", base_dir.display());
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        // The interval fires immediately; the first sweep waits a full period.
        interval.tick().await;

        loop {
            interval.tick().await;
            let dir = base_dir.clone();
            let removed = tokio::task::spawn_blocking(move || sweep_stale_jobs(&dir, max_age))
                .await
                .unwrap_or(0);

            if removed > 0 {
                info!("Scheduled cleanup: removed {removed} stale job folders");
            }
        }
    });
}
