//! Blue/green backend rollout:
//! pullOnline -> tagImages -> pushLocal -> checkImage -> deployService ->
//! checkService -> trafficSwitching -> cleanupOldVersion.
//!
//! The live colour in the version ledger advances after the traffic switch
//! succeeds and before the reclaimer touches the previous colour.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::context::AgentContext;
use crate::errors::AgentError;
use crate::notify::TaskStatus;
use crate::paths::Mode;
use crate::pipeline::{StepRunner, TaskKind, TaskSpec};
use crate::steps::check_image::ImageChecker;
use crate::steps::check_service::ServiceChecker;
use crate::steps::cleanup::VersionCleaner;
use crate::steps::deploy::ServiceDeployer;
use crate::steps::pull::ImagePuller;
use crate::steps::push::ImagePusher;
use crate::steps::tag;
use crate::steps::traffic::TrafficSwitcher;
use crate::tasks::logstore::TaskLogStore;

pub struct DoublePipeline {
    ctx: Arc<AgentContext>,
    logger: Arc<TaskLogStore>,
    runner: StepRunner,
}

impl DoublePipeline {
    pub fn new(
        ctx: Arc<AgentContext>,
        spec: TaskSpec,
        cancel: CancellationToken,
        logger: Arc<TaskLogStore>,
    ) -> Self {
        let ledger_base = ctx.resolver.project_base(&spec.project).ok();
        let runner = StepRunner::new(
            ctx.clone(),
            spec,
            cancel,
            ledger_base,
            TaskKind::Double,
        );
        Self { ctx, logger, runner }
    }

    pub async fn run(&self) -> Result<(), AgentError> {
        let spec = self.runner.spec().clone();
        let cancel = self.runner.cancel_token().clone();
        let resolver = &self.ctx.resolver;

        // Everything up to the cutover targets the next colour.
        let target_colour = self
            .runner
            .prelude(resolver.colour(&spec.project, Mode::Next).await)
            .await?;
        let next_namespace = self
            .runner
            .prelude(resolver.namespace(&spec.project, Mode::Next).await)
            .await?;

        self.logger.write_console(
            "INFO",
            &format!(
                "blue/green rollout targets colour {} (namespace {})",
                target_colour, next_namespace
            ),
        );

        // Service and image derivation belongs to the first step: a missing
        // or empty deployment directory fails with a step notification.
        let puller = ImagePuller::new(self.logger.clone());
        let (next_dir, online, offline) = self
            .runner
            .step(9, "pullOnline", "pull online images", || async {
                let next_dir = resolver.deployment_dir(&spec.project, Mode::Next).await?;
                let services = resolver.services(&next_dir).await?;
                let online = resolver.online_images(&spec.project, &spec.tag, &services);
                let offline = resolver.offline_images(&spec.project, &spec.tag, &services);

                if let Err(e) = puller.clean_project_images(&cancel, &spec.project).await {
                    if e.is_cancelled() {
                        return Err(e);
                    }
                    self.logger.write_step(
                        "pullOnline",
                        "WARNING",
                        &format!("image cleanup failed: {}", e),
                    );
                }
                puller.pull_images(&cancel, &online).await?;
                Ok((next_dir, online, offline))
            })
            .await?;

        self.runner
            .step(10, "tagImages", "tag images", || {
                tag::tag_images(&cancel, self.logger.clone(), &online, &offline)
            })
            .await?;

        let pusher = ImagePusher::new(self.logger.clone());
        self.runner
            .step(11, "pushLocal", "push local images", || {
                pusher.push_images(&cancel, &offline)
            })
            .await?;

        let checker = ImageChecker::new(self.ctx.settings.clone(), self.logger.clone());
        self.runner
            .step(12, "checkImage", "check registry artifacts", || {
                checker.check_images(&cancel, &offline, &spec.project, &spec.tag)
            })
            .await?;

        let deployer = ServiceDeployer::new(self.ctx.settings.clone(), self.logger.clone());
        self.runner
            .step(13, "deployService", "apply service manifests", || {
                deployer.deploy(&cancel, &next_dir, &spec.project, &spec.tag, &spec.category)
            })
            .await?;

        let service_checker = ServiceChecker::new(self.logger.clone());
        self.runner
            .step(14, "checkService", "check service readiness", || {
                service_checker.check_ready(&cancel, &next_namespace)
            })
            .await?;

        let switcher = TrafficSwitcher::new(self.ctx.settings.clone(), self.logger.clone());
        self.runner
            .step(15, "trafficSwitching", "switch traffic", || {
                switcher.switch(&cancel, &next_namespace, &spec.project, target_colour)
            })
            .await?;

        // Cutover done: the applied colour is now live.
        let base = self
            .runner
            .prelude(resolver.project_base(&spec.project))
            .await?;
        if let Err(e) = self.ctx.ledger.set_live_colour(&base, target_colour).await {
            error!("failed to record live colour: {}", e);
        }

        // With the ledger advanced, "next" resolves to the retired colour.
        let old_namespace = self
            .runner
            .prelude(resolver.namespace(&spec.project, Mode::Next).await)
            .await?;
        let old_dir = self
            .runner
            .prelude(resolver.deployment_dir(&spec.project, Mode::Next).await)
            .await?;
        self.logger.write_step(
            "cleanupOldVersion",
            "INFO",
            &format!(
                "live version is {}, reclaiming {} ({})",
                target_colour,
                old_namespace,
                old_dir.display()
            ),
        );

        let cleaner = VersionCleaner::new(self.logger.clone());
        self.runner
            .step(16, "cleanupOldVersion", "reclaim old version", || {
                cleaner.cleanup(&cancel, &old_namespace, &old_dir)
            })
            .await?;

        self.runner.finish(TaskStatus::Complete).await;
        Ok(())
    }
}
