//! Task log retention.
//!
//! Removes `logs/` subdirectories whose modification time is older than the
//! retention threshold, once at startup and then daily at 02:00 local time.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{Local, NaiveTime, TimeZone};
use tracing::{debug, error, info};

use crate::errors::AgentError;

const SWEEP_HOUR: u32 = 2;

/// Remove task log directories older than `max_days`. Returns the number of
/// directories removed. A missing root is a no-op.
pub async fn cleanup_old_logs(root: &Path, max_days: u32) -> Result<usize, AgentError> {
    if tokio::fs::metadata(root).await.is_err() {
        return Ok(0);
    }

    let cutoff = SystemTime::now() - Duration::from_secs(u64::from(max_days) * 24 * 3600);
    let mut removed = 0;

    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let meta = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                error!("failed to stat {}: {}", path.display(), e);
                continue;
            }
        };
        if !meta.is_dir() {
            continue;
        }

        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if modified < cutoff {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    removed += 1;
                    debug!("removed expired task log directory {}", path.display());
                }
                Err(e) => error!("failed to remove {}: {}", path.display(), e),
            }
        }
    }

    if removed > 0 {
        info!("log retention sweep removed {} directories", removed);
    }
    Ok(removed)
}

/// Duration until the next 02:00 local time.
fn until_next_sweep(now: chrono::DateTime<Local>) -> Duration {
    let sweep_time = NaiveTime::from_hms_opt(SWEEP_HOUR, 0, 0).unwrap();
    let today = now.date_naive().and_time(sweep_time);
    let next = if now.naive_local() < today {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    match Local.from_local_datetime(&next).earliest() {
        Some(next_local) => (next_local - now).to_std().unwrap_or(Duration::from_secs(60)),
        None => Duration::from_secs(24 * 3600),
    }
}

/// Spawn the retention worker: sweep immediately, then daily at 02:00.
pub fn start_retention_worker(root: PathBuf, max_days: u32) {
    tokio::spawn(async move {
        if let Err(e) = cleanup_old_logs(&root, max_days).await {
            error!("log retention sweep failed: {}", e);
        }

        loop {
            let wait = until_next_sweep(Local::now());
            tokio::time::sleep(wait).await;
            if let Err(e) = cleanup_old_logs(&root, max_days).await {
                error!("scheduled log retention sweep failed: {}", e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_cleanup_missing_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let removed = cleanup_old_logs(&dir.path().join("absent"), 7).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_fresh_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("task-1")).unwrap();
        let removed = cleanup_old_logs(dir.path(), 7).await.unwrap();
        assert_eq!(removed, 0);
        assert!(dir.path().join("task-1").exists());
    }

    #[tokio::test]
    async fn test_cleanup_ignores_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stray.log"), "x").unwrap();
        let removed = cleanup_old_logs(dir.path(), 0).await.unwrap();
        assert_eq!(removed, 0);
        assert!(dir.path().join("stray.log").exists());
    }

    #[test]
    fn test_until_next_sweep_before_and_after_two_am() {
        let before = Local.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
        assert_eq!(until_next_sweep(before), Duration::from_secs(3600));

        let after = Local.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        assert_eq!(until_next_sweep(after), Duration::from_secs(23 * 3600));
    }
}
