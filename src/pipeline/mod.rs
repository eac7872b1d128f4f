//! Rollout pipelines.
//!
//! Three linear state machines over the step vocabulary: `single` (one
//! replica), `double` (blue/green with traffic cutover) and `web` (static
//! bundle). Around every step the orchestrator notifies `start`, re-checks
//! the task's cancellation signal, runs the executor, and notifies the
//! terminal step status. Failure and cancellation emit task-level
//! notifications and the chat card; notification failures never abort a
//! rollout.

pub mod double;
pub mod single;
pub mod web;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::context::AgentContext;
use crate::errors::AgentError;
use crate::notify::{chat, StepStatus, TaskStatus};
use crate::tasks::logstore::TaskLogStore;

/// Rollout family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Single,
    Double,
    Web,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Single => "single",
            TaskKind::Double => "double",
            TaskKind::Web => "web",
        }
    }
}

/// Immutable task attributes, fixed at creation.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: String,
    pub project: String,
    pub tag: String,
    pub category: String,
    pub project_name: String,
    pub started_at: String,
    pub ops_url: String,
    pub pro_url: String,
    pub step_durations: HashMap<String, serde_json::Value>,
}

impl TaskSpec {
    /// Human label for cards; falls back to the project name.
    pub fn display_name(&self) -> &str {
        if self.project_name.is_empty() {
            &self.project
        } else {
            &self.project_name
        }
    }
}

/// Task id synthesised when the upstream does not supply one.
pub fn synthesize_task_id(project: &str, tag: &str) -> String {
    format!("{}-{}-{}", project, tag, Local::now().timestamp())
}

/// Classify a callback into a rollout family. An explicit type wins; empty
/// or unknown types auto-classify from the project name and configuration.
pub fn classify(settings: &Settings, requested: &str, project: &str) -> TaskKind {
    match requested {
        "single" => TaskKind::Single,
        "double" => TaskKind::Double,
        "web" => TaskKind::Web,
        _ => {
            if settings.is_web_project(project) {
                TaskKind::Web
            } else if settings.is_double_project(project) {
                TaskKind::Double
            } else {
                TaskKind::Single
            }
        }
    }
}

/// Run a task to its terminal state. Owns registry cleanup and log-store
/// shutdown on every exit path.
pub async fn run_task(
    ctx: Arc<AgentContext>,
    spec: TaskSpec,
    kind: TaskKind,
    cancel: CancellationToken,
) {
    let logger = Arc::new(TaskLogStore::new(&spec.task_id));
    logger.write_console(
        "INFO",
        &format!(
            "starting {} rollout: project={}, tag={}",
            kind.as_str(),
            spec.project,
            spec.tag
        ),
    );

    let result = match kind {
        TaskKind::Single => {
            single::SinglePipeline::new(ctx.clone(), spec.clone(), cancel.clone(), logger.clone())
                .run()
                .await
        }
        TaskKind::Double => {
            double::DoublePipeline::new(ctx.clone(), spec.clone(), cancel.clone(), logger.clone())
                .run()
                .await
        }
        TaskKind::Web => {
            web::WebPipeline::new(ctx.clone(), spec.clone(), cancel.clone(), logger.clone())
                .run()
                .await
        }
    };

    match &result {
        Ok(()) => info!(
            "rollout complete: project={}, tag={}, task={}",
            spec.project, spec.tag, spec.task_id
        ),
        Err(e) if e.is_cancelled() => info!(
            "rollout cancelled: project={}, task={}",
            spec.project, spec.task_id
        ),
        Err(e) => error!(
            "rollout failed: project={}, task={}: {}",
            spec.project, spec.task_id, e
        ),
    }

    ctx.registry.cleanup(&spec.task_id);
    logger.close();
}

/// Per-step orchestration shared by the pipelines.
pub(crate) struct StepRunner {
    ctx: Arc<AgentContext>,
    spec: TaskSpec,
    cancel: CancellationToken,
    /// Ledger directory for duration bookkeeping; `None` for web rollouts.
    ledger_base: Option<PathBuf>,
    kind: TaskKind,
}

impl StepRunner {
    pub fn new(
        ctx: Arc<AgentContext>,
        spec: TaskSpec,
        cancel: CancellationToken,
        ledger_base: Option<PathBuf>,
        kind: TaskKind,
    ) -> Self {
        Self {
            ctx,
            spec,
            cancel,
            ledger_base,
            kind,
        }
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one step: `start` notification, cancellation checkpoint, the
    /// executor, terminal step notification. Failures and cancellation also
    /// emit the task-terminal notifications.
    pub async fn step<T, F, Fut>(
        &self,
        step: u32,
        step_type: &str,
        step_name: &str,
        f: F,
    ) -> Result<T, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        self.notify_step(step, step_type, step_name, StepStatus::Start)
            .await;

        if self.cancel.is_cancelled() {
            self.notify_step(step, step_type, step_name, StepStatus::Cancel)
                .await;
            self.finish(TaskStatus::Cancel).await;
            return Err(AgentError::Cancelled);
        }

        match f().await {
            Ok(value) => {
                self.notify_step(step, step_type, step_name, StepStatus::Success)
                    .await;
                info!("step {} ({}) complete", step, step_type);
                Ok(value)
            }
            Err(e) if e.is_cancelled() => {
                self.notify_step(step, step_type, step_name, StepStatus::Cancel)
                    .await;
                self.finish(TaskStatus::Cancel).await;
                Err(AgentError::Cancelled)
            }
            Err(e) => {
                self.notify_step(step, step_type, step_name, StepStatus::Failed)
                    .await;
                self.finish(TaskStatus::Failed).await;
                Err(e)
            }
        }
    }

    /// Gate for derivations that run between steps: a failure still emits
    /// the task-terminal notifications before surfacing.
    pub async fn prelude<T>(&self, result: Result<T, AgentError>) -> Result<T, AgentError> {
        match result {
            Err(e) if !e.is_cancelled() => {
                self.finish(TaskStatus::Failed).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn notify_step(&self, step: u32, step_type: &str, step_name: &str, status: StepStatus) {
        if let Err(e) = self
            .ctx
            .notifier
            .send_step(
                self.ledger_base.as_deref(),
                &self.spec.task_id,
                step,
                step_type,
                step_name,
                status,
            )
            .await
        {
            error!("step notification failed: {}", e);
        }
    }

    /// Emit the task-terminal notification pair (control plane + chat card).
    pub async fn finish(&self, status: TaskStatus) {
        let spec = &self.spec;
        if let Err(e) = self
            .ctx
            .notifier
            .send_task(
                &spec.task_id,
                &spec.project,
                &spec.started_at,
                status,
                &spec.ops_url,
                &spec.pro_url,
                &spec.step_durations,
            )
            .await
        {
            error!("task notification failed: {}", e);
        }

        let current_version = match self.kind {
            TaskKind::Double => Some(self.live_colour_label().await),
            _ => None,
        };
        let end_time = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        if let Err(e) = chat::send_task_card(
            &self.ctx.http_client,
            &spec.ops_url,
            &spec.project,
            &spec.tag,
            status.wire(),
            &spec.started_at,
            &end_time,
            &spec.category,
            spec.display_name(),
            current_version.as_deref(),
        )
        .await
        {
            error!("chat card failed: {}", e);
        }
    }

    async fn live_colour_label(&self) -> String {
        match &self.ledger_base {
            Some(base) => match self.ctx.ledger.peek(base).await {
                Ok(Some(record)) => record.current_version.to_string(),
                Ok(None) => "unknown".to_string(),
                Err(_) => "unknown".to_string(),
            },
            None => "unknown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.deployment
            .double
            .insert("bluegreen".to_string(), "/data/bluegreen".to_string());
        s.deployment
            .single
            .insert("plain".to_string(), "/data/plain".to_string());
        s
    }

    #[test]
    fn test_classify_explicit_type_wins() {
        let s = settings();
        assert_eq!(classify(&s, "single", "bluegreen"), TaskKind::Single);
        assert_eq!(classify(&s, "double", "plain"), TaskKind::Double);
        assert_eq!(classify(&s, "web", "plain"), TaskKind::Web);
    }

    #[test]
    fn test_classify_auto() {
        let s = settings();
        assert_eq!(classify(&s, "", "site-web"), TaskKind::Web);
        assert_eq!(classify(&s, "", "bluegreen"), TaskKind::Double);
        assert_eq!(classify(&s, "", "plain"), TaskKind::Single);
        assert_eq!(classify(&s, "", "unconfigured"), TaskKind::Single);
    }

    #[test]
    fn test_classify_unknown_type_falls_back_to_auto() {
        let s = settings();
        assert_eq!(classify(&s, "canary", "bluegreen"), TaskKind::Double);
    }

    #[test]
    fn test_synthesized_task_id_shape() {
        let id = synthesize_task_id("svc-a", "1.2.3");
        assert!(id.starts_with("svc-a-1.2.3-"));
        let epoch: i64 = id.rsplit('-').next().unwrap().parse().unwrap();
        assert!(epoch > 1_600_000_000);
    }

    #[test]
    fn test_display_name_fallback() {
        let spec = TaskSpec {
            task_id: "t".to_string(),
            project: "svc-a".to_string(),
            tag: "1".to_string(),
            category: String::new(),
            project_name: String::new(),
            started_at: String::new(),
            ops_url: String::new(),
            pro_url: String::new(),
            step_durations: HashMap::new(),
        };
        assert_eq!(spec.display_name(), "svc-a");
    }
}
