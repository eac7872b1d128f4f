//! Per-project version ledger.
//!
//! One small JSON document at `<project_base>/.current` records the live
//! blue/green colour, the last update time, and per-step durations used for
//! ETA estimation. Writes go to a sibling temp file renamed into place so a
//! concurrent reader never observes a torn document. Callers for the same
//! project serialise through a per-project lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::AgentError;

const RECORD_FILE: &str = ".current";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Blue/green slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Colour {
    #[serde(rename = "v1")]
    V1,
    #[serde(rename = "v2")]
    V2,
}

impl Colour {
    pub fn opposite(self) -> Colour {
        match self {
            Colour::V1 => Colour::V2,
            Colour::V2 => Colour::V1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Colour::V1 => "v1",
            Colour::V2 => "v2",
        }
    }
}

impl std::fmt::Display for Colour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The on-disk record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub current_version: Colour,
    pub last_updated: String,
    /// Step key (`step_<N>_<stepType>`) -> duration. Values are kept loose
    /// because upstream payloads echo them back untyped.
    #[serde(default)]
    pub step_durations: HashMap<String, serde_json::Value>,
}

impl VersionRecord {
    fn new_default() -> Self {
        Self {
            current_version: Colour::V1,
            last_updated: Local::now().format(TIME_FORMAT).to_string(),
            step_durations: HashMap::new(),
        }
    }

    /// Duration in seconds for a step key, when present and numeric.
    pub fn duration_secs(&self, step_key: &str) -> Option<f64> {
        self.step_durations.get(step_key).and_then(|v| v.as_f64())
    }
}

/// Shared ledger over all projects' `.current` files.
#[derive(Default)]
pub struct VersionLedger {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, base: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(base.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn record_path(base: &Path) -> PathBuf {
        base.join(RECORD_FILE)
    }

    /// Read the record, creating the `v1` default when the file is absent.
    pub async fn read(&self, base: &Path) -> Result<VersionRecord, AgentError> {
        let lock = self.lock_for(base);
        let _guard = lock.lock().await;
        self.read_locked(base).await
    }

    /// Read the record without creating it. `None` when no ledger exists —
    /// the resolver's "first deployment lands on v1" rule hangs off this.
    pub async fn peek(&self, base: &Path) -> Result<Option<VersionRecord>, AgentError> {
        let path = Self::record_path(base);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let record = serde_json::from_str(&contents).map_err(|e| {
                    AgentError::ConfigError(format!(
                        "invalid version record {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_locked(&self, base: &Path) -> Result<VersionRecord, AgentError> {
        match self.peek(base).await? {
            Some(record) => Ok(record),
            None => {
                let record = VersionRecord::new_default();
                self.write_locked(base, &record).await?;
                Ok(record)
            }
        }
    }

    /// Live colour, creating the default record when absent.
    pub async fn live_colour(&self, base: &Path) -> Result<Colour, AgentError> {
        Ok(self.read(base).await?.current_version)
    }

    /// Record the new live colour after a successful cutover.
    pub async fn set_live_colour(&self, base: &Path, colour: Colour) -> Result<(), AgentError> {
        let lock = self.lock_for(base);
        let _guard = lock.lock().await;
        let mut record = self.read_locked(base).await?;
        record.current_version = colour;
        record.last_updated = Local::now().format(TIME_FORMAT).to_string();
        self.write_locked(base, &record).await
    }

    /// Record a step duration (rounded to 2 decimals).
    pub async fn record_duration(
        &self,
        base: &Path,
        step_key: &str,
        seconds: f64,
    ) -> Result<(), AgentError> {
        let rounded = (seconds * 100.0).round() / 100.0;
        let lock = self.lock_for(base);
        let _guard = lock.lock().await;
        let mut record = self.read_locked(base).await?;
        record
            .step_durations
            .insert(step_key.to_string(), serde_json::json!(rounded));
        record.last_updated = Local::now().format(TIME_FORMAT).to_string();
        self.write_locked(base, &record).await
    }

    async fn write_locked(&self, base: &Path, record: &VersionRecord) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(base).await?;
        let path = Self::record_path(base);
        let contents = serde_json::to_string_pretty(record)?;

        // Sibling temp + rename so concurrent readers never see a torn file.
        let temp = path.with_extension("current.tmp");
        tokio::fs::write(&temp, contents.as_bytes()).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = VersionLedger::new();

        let record = ledger.read(dir.path()).await.unwrap();
        assert_eq!(record.current_version, Colour::V1);
        assert!(record.step_durations.is_empty());
        assert!(dir.path().join(".current").exists());
    }

    #[tokio::test]
    async fn test_peek_does_not_create() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = VersionLedger::new();

        assert!(ledger.peek(dir.path()).await.unwrap().is_none());
        assert!(!dir.path().join(".current").exists());
    }

    #[tokio::test]
    async fn test_set_live_colour_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = VersionLedger::new();

        ledger.set_live_colour(dir.path(), Colour::V2).await.unwrap();
        assert_eq!(ledger.live_colour(dir.path()).await.unwrap(), Colour::V2);

        // colour survives an independent ledger instance
        let other = VersionLedger::new();
        assert_eq!(other.live_colour(dir.path()).await.unwrap(), Colour::V2);
    }

    #[tokio::test]
    async fn test_record_duration_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = VersionLedger::new();

        ledger
            .record_duration(dir.path(), "step_9_pullOnline", 12.3456)
            .await
            .unwrap();
        let record = ledger.read(dir.path()).await.unwrap();
        assert_eq!(record.duration_secs("step_9_pullOnline"), Some(12.35));
    }

    #[tokio::test]
    async fn test_duration_update_preserves_colour() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = VersionLedger::new();

        ledger.set_live_colour(dir.path(), Colour::V2).await.unwrap();
        ledger
            .record_duration(dir.path(), "step_13_deployService", 5.0)
            .await
            .unwrap();
        let record = ledger.read(dir.path()).await.unwrap();
        assert_eq!(record.current_version, Colour::V2);
    }

    #[test]
    fn test_colour_opposite() {
        assert_eq!(Colour::V1.opposite(), Colour::V2);
        assert_eq!(Colour::V2.opposite(), Colour::V1);
    }
}
