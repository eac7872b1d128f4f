//! Notifications to the upstream control plane.
//!
//! Two payload kinds share one envelope: step-level progress events and
//! task-terminal events. The bus also keeps the step-timing memory that
//! turns a start/terminal pair into a duration, persisted to the version
//! ledger after the terminal notification is delivered.

pub mod chat;
pub mod envelope;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::errors::AgentError;
use crate::version::VersionLedger;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// ETA fallback when a step has no recorded history.
const DEFAULT_ESTIMATE_SECS: f64 = 30.0;

/// Step event status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Start,
    Success,
    Failed,
    Cancel,
}

impl StepStatus {
    fn wire(self) -> &'static str {
        match self {
            StepStatus::Start => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Cancel => "cancel",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Start)
    }
}

/// Task terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Complete,
    Failed,
    Cancel,
}

impl TaskStatus {
    pub fn wire(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancel => "cancel",
        }
    }
}

/// Unified notification payload; `isset` discriminates step from task.
#[derive(Debug, Default, Serialize)]
struct NotificationData {
    isset: bool,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ops_feishu_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pro_feishu_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<String>,
    finished_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_durations: Option<HashMap<String, serde_json::Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_status: Option<String>,
    duration: f64,
    last_duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_end: Option<String>,
}

/// Standard step key: `step_<N>_<stepType>`.
pub fn step_key(step: u32, step_type: &str) -> String {
    format!("step_{}_{}", step, step_type)
}

/// Legacy step key still accepted on lookup: `<taskId>_<N>_<stepType>`.
fn legacy_step_key(task_id: &str, step: u32, step_type: &str) -> String {
    format!("{}_{}_{}", task_id, step, step_type)
}

/// Notification bus shared across pipelines.
pub struct NotificationBus {
    settings: Arc<Settings>,
    ledger: Arc<VersionLedger>,
    client: reqwest::Client,
    step_starts: Mutex<HashMap<String, DateTime<Local>>>,
}

impl NotificationBus {
    pub fn new(settings: Arc<Settings>, ledger: Arc<VersionLedger>) -> Self {
        Self {
            settings,
            ledger,
            client: reqwest::Client::new(),
            step_starts: Mutex::new(HashMap::new()),
        }
    }

    /// Emit a step-level event.
    ///
    /// `ledger_base` is the project's ledger directory for backend rollouts;
    /// web rollouts pass `None`, which suppresses the history lookup and the
    /// ETA field. Failures are reported to the caller but the pipelines only
    /// log them.
    pub async fn send_step(
        &self,
        ledger_base: Option<&Path>,
        task_id: &str,
        step: u32,
        step_type: &str,
        step_name: &str,
        status: StepStatus,
    ) -> Result<(), AgentError> {
        let key = step_key(step, step_type);
        let now = Local::now();

        let last_duration = match ledger_base {
            Some(base) => self.last_step_duration(base, &key).await,
            None => 0.0,
        };
        let estimated_end = ledger_base.map(|_| {
            let estimate = if last_duration > 0.0 {
                last_duration
            } else {
                DEFAULT_ESTIMATE_SECS
            };
            (now + chrono::Duration::milliseconds((estimate * 1000.0) as i64))
                .format(TIME_FORMAT)
                .to_string()
        });

        let mut data = NotificationData {
            isset: true,
            id: task_id.to_string(),
            step: Some(step),
            step_type: Some(step_type.to_string()),
            step_name: Some(step_name.to_string()),
            step_status: Some(status.wire().to_string()),
            remote: Some("agent".to_string()),
            last_duration,
            estimated_end,
            ..Default::default()
        };

        // Start/terminal bookkeeping. The legacy <taskId>_<N>_<type> key is
        // still recognised on lookup.
        let start = {
            let mut starts = self.step_starts.lock().unwrap();
            let legacy = legacy_step_key(task_id, step, step_type);
            let found = if starts.contains_key(&key) {
                Some(key.clone())
            } else if starts.contains_key(&legacy) {
                Some(legacy)
            } else {
                None
            };

            match found {
                Some(found_key) => {
                    let started = starts[&found_key];
                    if status.is_terminal() {
                        starts.remove(&found_key);
                    }
                    Some(started)
                }
                None => {
                    if status == StepStatus::Start {
                        starts.insert(key.clone(), now);
                        Some(now)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(started) = start {
            data.step_started_at = Some(started.format(TIME_FORMAT).to_string());
            if status.is_terminal() {
                data.step_finished_at = Some(now.format(TIME_FORMAT).to_string());
                let millis = (now - started).num_milliseconds();
                data.duration = (millis as f64 / 1000.0 * 100.0).round() / 100.0;
            }
        }

        let duration = data.duration;
        self.post_envelope(&data).await?;

        // Persist the duration only after the notification landed.
        if status.is_terminal() && duration > 0.0 {
            if let Some(base) = ledger_base {
                if let Err(e) = self.ledger.record_duration(base, &key, duration).await {
                    warn!("failed to persist duration for {}: {}", key, e);
                }
            }
        }
        Ok(())
    }

    /// Emit a task-level event.
    pub async fn send_task(
        &self,
        task_id: &str,
        name: &str,
        started_at: &str,
        status: TaskStatus,
        ops_url: &str,
        pro_url: &str,
        step_durations: &HashMap<String, serde_json::Value>,
    ) -> Result<(), AgentError> {
        let data = NotificationData {
            isset: false,
            id: task_id.to_string(),
            name: Some(name.to_string()),
            started_at: Some(started_at.to_string()),
            finished_at: Local::now().format(TIME_FORMAT).to_string(),
            status: Some(status.wire().to_string()),
            remote: Some("agent".to_string()),
            ops_feishu_url: Some(ops_url.to_string()),
            pro_feishu_url: Some(pro_url.to_string()),
            step_durations: Some(step_durations.clone()),
            ..Default::default()
        };
        self.post_envelope(&data).await
    }

    async fn last_step_duration(&self, base: &Path, step_key: &str) -> f64 {
        match self.ledger.peek(base).await {
            Ok(Some(record)) => record
                .duration_secs(step_key)
                .map(|d| (d * 100.0).round() / 100.0)
                .unwrap_or(0.0),
            Ok(None) => 0.0,
            Err(e) => {
                warn!("failed to read version record for {}: {}", base.display(), e);
                0.0
            }
        }
    }

    async fn post_envelope(&self, data: &NotificationData) -> Result<(), AgentError> {
        let Some(notify_url) = self.settings.notify_url() else {
            info!("notifications disabled, skipping");
            return Ok(());
        };

        let payload = serde_json::to_vec(data)?;
        let encrypted = envelope::compress_and_encrypt(self.settings.encryption_salt(), &payload)?;
        let body = serde_json::json!({
            "code": 200,
            "msg": "success",
            "data": encrypted,
        });

        let resp = self
            .client
            .post(notify_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::NotifyError(format!("notification request failed: {}", e)))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::NotifyError(format!(
                "notification endpoint returned {}: {}",
                status, text
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    fn seed_start(&self, key: &str, at: DateTime<Local>) {
        self.step_starts.lock().unwrap().insert(key.to_string(), at);
    }

    #[cfg(test)]
    fn has_start(&self, key: &str) -> bool {
        self.step_starts.lock().unwrap().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> NotificationBus {
        // Notifications disabled: post_envelope short-circuits, which lets
        // the timing bookkeeping run without a live endpoint.
        NotificationBus::new(
            Arc::new(Settings::default()),
            Arc::new(VersionLedger::new()),
        )
    }

    #[test]
    fn test_step_key_format() {
        assert_eq!(step_key(9, "pullOnline"), "step_9_pullOnline");
    }

    #[tokio::test]
    async fn test_start_then_terminal_clears_memory() {
        let bus = bus();
        bus.send_step(None, "t1", 9, "pullOnline", "pull", StepStatus::Start)
            .await
            .unwrap();
        assert!(bus.has_start("step_9_pullOnline"));

        bus.send_step(None, "t1", 9, "pullOnline", "pull", StepStatus::Success)
            .await
            .unwrap();
        assert!(!bus.has_start("step_9_pullOnline"));
    }

    #[tokio::test]
    async fn test_legacy_key_recognised() {
        let bus = bus();
        bus.seed_start("t1_10_tagImages", Local::now());

        bus.send_step(None, "t1", 10, "tagImages", "tag", StepStatus::Failed)
            .await
            .unwrap();
        assert!(!bus.has_start("t1_10_tagImages"));
    }

    #[tokio::test]
    async fn test_terminal_without_start_records_nothing() {
        let bus = bus();
        bus.send_step(None, "t1", 11, "pushLocal", "push", StepStatus::Cancel)
            .await
            .unwrap();
        assert!(!bus.has_start("step_11_pushLocal"));
    }

    #[tokio::test]
    async fn test_terminal_persists_duration_to_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(VersionLedger::new());
        let bus = NotificationBus::new(Arc::new(Settings::default()), ledger.clone());

        bus.seed_start("step_13_deployService", Local::now() - chrono::Duration::seconds(4));
        bus.send_step(
            Some(dir.path()),
            "t1",
            13,
            "deployService",
            "deploy",
            StepStatus::Success,
        )
        .await
        .unwrap();

        let record = ledger.read(dir.path()).await.unwrap();
        let recorded = record.duration_secs("step_13_deployService").unwrap();
        assert!(recorded >= 3.9 && recorded < 6.0, "recorded {}", recorded);
    }

    #[tokio::test]
    async fn test_web_task_skips_ledger() {
        let bus = bus();
        bus.seed_start("step_7_downProduct", Local::now());
        // ledger_base None: no history lookup, no persistence, no panic
        bus.send_step(None, "t1", 7, "downProduct", "down", StepStatus::Success)
            .await
            .unwrap();
    }
}
