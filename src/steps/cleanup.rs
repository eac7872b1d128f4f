//! Old-version reclaimer (step `cleanupOldVersion`).
//!
//! After the cutover, the previous colour idles for a quiescence window and
//! is then scaled to zero. Manifests stay on disk: the namespace is only
//! drained of pods so the next rollout can reuse the slot.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::AgentError;
use crate::procs::{cancellable_sleep, display_command, run_tool};
use crate::tasks::logstore::TaskLogStore;

const STEP: &str = "cleanupOldVersion";

/// Grace period before touching the old colour.
const QUIESCENCE_DELAY: Duration = Duration::from_secs(55);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const DRAIN_INTERVAL: Duration = Duration::from_secs(10);

pub struct VersionCleaner {
    logger: Arc<TaskLogStore>,
}

impl VersionCleaner {
    pub fn new(logger: Arc<TaskLogStore>) -> Self {
        Self { logger }
    }

    /// Scale the old namespace's Deployments to zero and wait for its pods
    /// to drain. Running against an already-empty namespace succeeds.
    pub async fn cleanup(
        &self,
        cancel: &CancellationToken,
        old_namespace: &str,
        old_deployment_dir: &Path,
    ) -> Result<(), AgentError> {
        self.logger.write_step(
            STEP,
            "INFO",
            &format!(
                "reclaiming old version: namespace {}, directory {}",
                old_namespace,
                old_deployment_dir.display()
            ),
        );

        self.logger
            .write_step(STEP, "INFO", "waiting 55s for the new version to stabilise");
        cancellable_sleep(cancel, QUIESCENCE_DELAY).await?;

        if tokio::fs::metadata(old_deployment_dir).await.is_err() {
            self.logger.write_step(
                STEP,
                "INFO",
                &format!(
                    "old deployment directory {} does not exist, nothing to reclaim",
                    old_deployment_dir.display()
                ),
            );
            return Ok(());
        }

        self.scale_down_deployments(cancel, old_namespace).await?;
        self.wait_for_drain(cancel, old_namespace).await?;

        self.logger
            .write_step(STEP, "INFO", "old version reclaimed");
        Ok(())
    }

    async fn scale_down_deployments(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<(), AgentError> {
        let args = [
            "get",
            "deployments",
            "-n",
            namespace,
            "--no-headers",
            "-o",
            "custom-columns=NAME:.metadata.name,REPLICAS:.spec.replicas",
        ];
        let out = run_tool(cancel, "kubectl", &args, None).await?;
        self.logger
            .write_command(STEP, &display_command("kubectl", &args), &out.output, None);

        if !out.success {
            if out.text().contains("No resources found") {
                self.logger.write_step(
                    STEP,
                    "INFO",
                    &format!("no deployments in namespace {}", namespace),
                );
                return Ok(());
            }
            return Err(AgentError::ToolError(format!(
                "failed to list deployments in {}: {}",
                namespace,
                out.text().trim()
            )));
        }

        for line in out.text().lines() {
            let mut parts = line.split_whitespace();
            let (Some(name), Some(replicas)) = (parts.next(), parts.next()) else {
                continue;
            };
            if replicas == "0" {
                self.logger.write_step(
                    STEP,
                    "INFO",
                    &format!("deployment {} already at zero replicas", name),
                );
                continue;
            }

            self.logger.write_step(
                STEP,
                "INFO",
                &format!("scaling deployment {} ({} replicas) to zero", name, replicas),
            );
            let scale_args = ["scale", "deployment", name, "-n", namespace, "--replicas=0"];
            let scale_out = run_tool(cancel, "kubectl", &scale_args, None).await?;
            self.logger.write_command(
                STEP,
                &display_command("kubectl", &scale_args),
                &scale_out.output,
                (!scale_out.success).then_some("kubectl scale failed"),
            );
            if !scale_out.success {
                return Err(AgentError::ToolError(format!(
                    "failed to scale deployment {} to zero: {}",
                    name,
                    scale_out.text().trim()
                )));
            }
        }

        Ok(())
    }

    /// Poll until the namespace has no pods left.
    async fn wait_for_drain(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<(), AgentError> {
        self.logger
            .write_step(STEP, "INFO", "waiting for old pods to terminate");
        let deadline = Instant::now() + DRAIN_TIMEOUT;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            if !self.has_pods(cancel, namespace).await {
                self.logger
                    .write_step(STEP, "INFO", "old namespace fully drained");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(AgentError::ToolError(format!(
                    "timed out waiting for pods in {} to terminate",
                    namespace
                )));
            }

            self.logger
                .write_step(STEP, "INFO", "old pods still terminating, waiting");
            cancellable_sleep(cancel, DRAIN_INTERVAL).await?;
        }
    }

    async fn has_pods(&self, cancel: &CancellationToken, namespace: &str) -> bool {
        let args = ["get", "pods", "-n", namespace, "--no-headers", "-o", "name"];
        match run_tool(cancel, "kubectl", &args, None).await {
            Ok(out) => {
                self.logger
                    .write_command(STEP, &display_command("kubectl", &args), &out.output, None);
                // a failed listing means the namespace is gone or unreadable;
                // either way there is nothing left to wait for
                out.success && !out.text().trim().is_empty()
            }
            Err(_) => false,
        }
    }
}
