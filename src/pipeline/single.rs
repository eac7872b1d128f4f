//! Single-replica backend rollout:
//! pullOnline -> tagImages -> pushLocal -> checkImage -> deployService.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::context::AgentContext;
use crate::errors::AgentError;
use crate::notify::TaskStatus;
use crate::paths::Mode;
use crate::pipeline::{StepRunner, TaskKind, TaskSpec};
use crate::steps::check_image::ImageChecker;
use crate::steps::deploy::ServiceDeployer;
use crate::steps::pull::ImagePuller;
use crate::steps::push::ImagePusher;
use crate::steps::tag;
use crate::tasks::logstore::TaskLogStore;

pub struct SinglePipeline {
    ctx: Arc<AgentContext>,
    logger: Arc<TaskLogStore>,
    runner: StepRunner,
}

impl SinglePipeline {
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
            TaskKind::Single,
        );
        Self { ctx, logger, runner }
    }

    pub async fn run(&self) -> Result<(), AgentError> {
        let spec = self.runner.spec().clone();
        let cancel = self.runner.cancel_token().clone();
        let resolver = &self.ctx.resolver;

        // Service and image derivation belongs to the first step: a missing
        // or empty deployment directory fails with a step notification.
        let puller = ImagePuller::new(self.logger.clone());
        let (deploy_dir, online, offline) = self
            .runner
            .step(9, "pullOnline", "pull online images", || async {
                let deploy_dir = resolver.deployment_dir(&spec.project, Mode::Next).await?;
                let services = resolver.services(&deploy_dir).await?;
                let online = resolver.online_images(&spec.project, &spec.tag, &services);
                let offline = resolver.offline_images(&spec.project, &spec.tag, &services);

                if let Err(e) = puller.clean_project_images(&cancel, &spec.project).await {
                    if e.is_cancelled() {
                        return Err(e);
                    }
                    // stale-image cleanup is best-effort
                    self.logger.write_step(
                        "pullOnline",
                        "WARNING",
                        &format!("image cleanup failed: {}", e),
                    );
                }
                puller.pull_images(&cancel, &online).await?;
                Ok((deploy_dir, online, offline))
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
                deployer.deploy(&cancel, &deploy_dir, &spec.project, &spec.tag, &spec.category)
            })
            .await?;

        self.runner.finish(TaskStatus::Complete).await;
        Ok(())
    }
}
