//! Readiness prober (step `checkService`).
//!
//! Two-phase validation of the freshly deployed colour. Phase A waits for
//! every pod in the namespace to reach `Running`; Phase B execs into each
//! pod and probes the application health endpoint. Either phase failing (or
//! timing out) scales the namespace's controllers to zero so the broken
//! colour does not hold resources.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::AgentError;
use crate::procs::{cancellable_sleep, display_command, run_tool};
use crate::tasks::logstore::TaskLogStore;

const STEP: &str = "checkService";

/// Pods take a moment to materialise after apply.
const SETTLE_DELAY: Duration = Duration::from_secs(15);
const PHASE_A_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const PHASE_A_INTERVAL: Duration = Duration::from_secs(10);
const PHASE_A_REQUIRED_PASSES: u32 = 2;
const PHASE_B_TIMEOUT: Duration = Duration::from_secs(60);
const PHASE_B_INTERVAL: Duration = Duration::from_secs(3);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ServiceChecker {
    logger: Arc<TaskLogStore>,
}

impl ServiceChecker {
    pub fn new(logger: Arc<TaskLogStore>) -> Self {
        Self { logger }
    }

    pub async fn check_ready(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<(), AgentError> {
        self.logger.write_step(
            STEP,
            "INFO",
            &format!("checking pod readiness in namespace {}", namespace),
        );

        self.logger
            .write_step(STEP, "INFO", "waiting 15s for pods to materialise");
        cancellable_sleep(cancel, SETTLE_DELAY).await?;

        self.logger
            .write_step(STEP, "INFO", "phase A: waiting for all pods to reach Running");
        self.wait_for_pods_running(cancel, namespace).await?;

        self.logger
            .write_step(STEP, "INFO", "phase B: probing application health");
        self.check_pods_health(cancel, namespace).await?;

        self.logger
            .write_step(STEP, "INFO", "all pods ready, service check passed");
        Ok(())
    }

    /// Phase A. Any pod in a phase outside {Pending, ContainerCreating,
    /// Running} fails immediately; passing requires every pod Running on two
    /// consecutive polls.
    async fn wait_for_pods_running(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<(), AgentError> {
        let deadline = Instant::now() + PHASE_A_TIMEOUT;
        let mut consecutive_passes = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if Instant::now() >= deadline {
                let pods = self.pods_with_phase(cancel, namespace).await.unwrap_or_default();
                let not_running: Vec<String> = pods
                    .iter()
                    .filter(|(_, phase)| phase != "Running")
                    .map(|(name, phase)| format!("{}({})", name, phase))
                    .collect();

                self.logger.write_step(
                    STEP,
                    "ERROR",
                    &format!(
                        "phase A timed out, scaling controllers to zero; pods not Running: {}",
                        not_running.join(", ")
                    ),
                );
                self.scale_down_all(cancel, namespace).await;
                return Err(AgentError::ReadinessError(format!(
                    "timed out waiting for pods in {} to reach Running: {}",
                    namespace,
                    not_running.join(", ")
                )));
            }

            let pods = self.pods_with_phase(cancel, namespace).await?;

            let abnormal: Vec<String> = pods
                .iter()
                .filter(|(_, phase)| !is_normal_phase(phase))
                .map(|(name, phase)| format!("{}({})", name, phase))
                .collect();
            if !abnormal.is_empty() {
                self.logger.write_step(
                    STEP,
                    "ERROR",
                    &format!(
                        "{} pods in abnormal state, scaling controllers to zero: {}",
                        abnormal.len(),
                        abnormal.join(", ")
                    ),
                );
                self.scale_down_all(cancel, namespace).await;
                return Err(AgentError::ReadinessError(format!(
                    "abnormal pod state in {}: {}",
                    namespace,
                    abnormal.join(", ")
                )));
            }

            let total = pods.len();
            let running = pods.iter().filter(|(_, phase)| phase == "Running").count();
            self.logger.write_step(
                STEP,
                "INFO",
                &format!("pod phases: total={}, running={}", total, running),
            );

            if total > 0 && running == total {
                consecutive_passes += 1;
                if consecutive_passes >= PHASE_A_REQUIRED_PASSES {
                    self.logger
                        .write_step(STEP, "INFO", "all pods Running on two consecutive polls");
                    return Ok(());
                }
            } else {
                consecutive_passes = 0;
            }

            cancellable_sleep(cancel, PHASE_A_INTERVAL).await?;
        }
    }

    /// Phase B. Pods are re-enumerated every round so replacements join the
    /// set and vanished pods drop out of it.
    async fn check_pods_health(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<(), AgentError> {
        let deadline = Instant::now() + PHASE_B_TIMEOUT;
        let mut healthy: HashSet<String> = HashSet::new();
        let mut round = 0u32;

        loop {
            round += 1;
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if Instant::now() >= deadline {
                let pods = self.pod_names(cancel, namespace).await.unwrap_or_default();
                let pending: Vec<String> =
                    pods.into_iter().filter(|p| !healthy.contains(p)).collect();

                self.logger.write_step(
                    STEP,
                    "ERROR",
                    &format!(
                        "phase B timed out, scaling controllers to zero; unhealthy pods: {}",
                        pending.join(", ")
                    ),
                );
                self.scale_down_all(cancel, namespace).await;
                return Err(AgentError::ReadinessError(format!(
                    "health check timed out in {}, {} pods unhealthy: {}",
                    namespace,
                    pending.len(),
                    pending.join(", ")
                )));
            }

            let pods = self.pod_names(cancel, namespace).await?;
            if pods.is_empty() {
                return Err(AgentError::ReadinessError(format!(
                    "no pods found in namespace {}",
                    namespace
                )));
            }

            let pending: Vec<String> = pods
                .iter()
                .filter(|p| !healthy.contains(*p))
                .cloned()
                .collect();
            self.logger.write_step(
                STEP,
                "INFO",
                &format!(
                    "health round {}: total={}, healthy={}, pending={}",
                    round,
                    pods.len(),
                    pods.len() - pending.len(),
                    pending.len()
                ),
            );

            if pending.is_empty() {
                return Ok(());
            }

            let newly = self.probe_pods(cancel, namespace, &pending).await;
            for pod in newly {
                self.logger
                    .write_step(STEP, "INFO", &format!("pod {} health check passed", pod));
                healthy.insert(pod);
            }

            let still_pending = pods.iter().any(|p| !healthy.contains(p));
            if !still_pending {
                return Ok(());
            }

            cancellable_sleep(cancel, PHASE_B_INTERVAL).await?;
        }
    }

    /// Probe a batch of pods, returning those that answered healthy.
    async fn probe_pods(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        pods: &[String],
    ) -> Vec<String> {
        use tokio::sync::Semaphore;

        let cap = probe_concurrency(pods.len());
        let semaphore = Arc::new(Semaphore::new(cap));
        let mut handles = Vec::with_capacity(pods.len());

        for pod in pods {
            let sem = semaphore.clone();
            let token = cancel.clone();
            let namespace = namespace.to_string();
            let pod = pod.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.ok()?;
                if token.is_cancelled() {
                    return None;
                }
                probe_pod_health(&token, &namespace, &pod)
                    .await
                    .then_some(pod)
            }));
        }

        futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|result| result.ok().flatten())
            .collect()
    }

    async fn pods_with_phase(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<Vec<(String, String)>, AgentError> {
        let jsonpath =
            r#"jsonpath={range .items[*]}{.metadata.name}{"\t"}{.status.phase}{"\n"}{end}"#;
        let args = ["get", "pods", "-n", namespace, "-o", jsonpath];

        let out = run_tool(cancel, "kubectl", &args, None).await?;
        if !out.success {
            return Err(AgentError::ReadinessError(format!(
                "failed to list pods in {}: {}",
                namespace,
                out.text().trim()
            )));
        }

        Ok(out
            .text()
            .lines()
            .filter_map(|line| {
                let (name, phase) = line.split_once('\t')?;
                let name = name.trim();
                let phase = phase.trim();
                (!name.is_empty()).then(|| (name.to_string(), phase.to_string()))
            })
            .collect())
    }

    async fn pod_names(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<Vec<String>, AgentError> {
        let args = [
            "get",
            "pods",
            "-n",
            namespace,
            "--no-headers",
            "-o",
            "custom-columns=NAME:.metadata.name",
        ];
        let out = run_tool(cancel, "kubectl", &args, None).await?;
        if !out.success {
            return Err(AgentError::ReadinessError(format!(
                "failed to list pods in {}: {}",
                namespace,
                out.text().trim()
            )));
        }
        Ok(parse_name_lines(&out.text()))
    }

    /// Scale every Deployment, StatefulSet and standalone ReplicaSet in the
    /// namespace to zero replicas. Best-effort: individual failures are
    /// logged and the sweep continues.
    pub async fn scale_down_all(&self, cancel: &CancellationToken, namespace: &str) {
        self.logger.write_step(
            STEP,
            "ERROR",
            &format!("scaling all controllers in {} to zero", namespace),
        );

        for kind in ["deployment", "statefulset"] {
            let plural = format!("{}s", kind);
            let args = [
                "get",
                plural.as_str(),
                "-n",
                namespace,
                "--no-headers",
                "-o",
                "custom-columns=NAME:.metadata.name",
            ];
            match run_tool(cancel, "kubectl", &args, None).await {
                Ok(out) => {
                    self.logger.write_command(
                        STEP,
                        &display_command("kubectl", &args),
                        &out.output,
                        None,
                    );
                    if out.success {
                        for name in parse_name_lines(&out.text()) {
                            self.scale_to_zero(cancel, namespace, kind, &name).await;
                        }
                    }
                }
                Err(_) => return,
            }
        }

        // Standalone ReplicaSets only; those owned by a Deployment follow it.
        let args = [
            "get",
            "replicasets",
            "-n",
            namespace,
            "--no-headers",
            "-o",
            "custom-columns=NAME:.metadata.name,OWNER:.metadata.ownerReferences[0].kind",
        ];
        if let Ok(out) = run_tool(cancel, "kubectl", &args, None).await {
            self.logger
                .write_command(STEP, &display_command("kubectl", &args), &out.output, None);
            if out.success {
                for line in out.text().lines() {
                    let mut parts = line.split_whitespace();
                    let (Some(name), Some(owner)) = (parts.next(), parts.next()) else {
                        continue;
                    };
                    if owner != "Deployment" && !name.is_empty() {
                        self.scale_to_zero(cancel, namespace, "replicaset", name).await;
                    }
                }
            }
        }

        self.logger
            .write_step(STEP, "ERROR", "scale-to-zero sweep finished");
    }

    async fn scale_to_zero(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        kind: &str,
        name: &str,
    ) {
        let args = ["scale", kind, name, "-n", namespace, "--replicas=0"];
        match run_tool(cancel, "kubectl", &args, None).await {
            Ok(out) => {
                self.logger.write_command(
                    STEP,
                    &display_command("kubectl", &args),
                    &out.output,
                    (!out.success).then_some("kubectl scale failed"),
                );
                let level = if out.success { "INFO" } else { "ERROR" };
                self.logger.write_step(
                    STEP,
                    level,
                    &format!("scaled {} {} to zero: success={}", kind, name, out.success),
                );
            }
            Err(e) => self.logger.write_step(
                STEP,
                "ERROR",
                &format!("failed to scale {} {}: {}", kind, name, e),
            ),
        }
    }
}

/// Exec the in-pod health endpoint. Healthy iff the body is non-empty and
/// mentions `status` (UP/DOWN are not differentiated: any response means the
/// application is serving).
async fn probe_pod_health(cancel: &CancellationToken, namespace: &str, pod: &str) -> bool {
    let args = [
        "exec",
        "-n",
        namespace,
        pod,
        "-c",
        "filebeat",
        "--",
        "curl",
        "-s",
        "http://127.0.0.1:8080/actuator/health",
    ];

    let result = tokio::time::timeout(
        HEALTH_PROBE_TIMEOUT,
        run_tool(cancel, "kubectl", &args, None),
    )
    .await;

    match result {
        Ok(Ok(out)) if out.success => {
            let body = out.text();
            let body = body.trim();
            !body.is_empty() && body.contains("status")
        }
        _ => false,
    }
}

fn is_normal_phase(phase: &str) -> bool {
    matches!(phase, "Pending" | "ContainerCreating" | "Running")
}

fn probe_concurrency(pending: usize) -> usize {
    if pending <= 100 {
        pending.clamp(1, 20)
    } else {
        30
    }
}

fn parse_name_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "No resources found")
        .map(str::to_string)
        .collect()
}
