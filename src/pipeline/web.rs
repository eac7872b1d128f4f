//! Front-end bundle rollout:
//! downProduct -> extractProduct -> backupCurrent -> deployNew.
//!
//! A failed deployNew restores the backup; rollback failures are logged but
//! not re-raised. Temp files are cleaned on success.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::context::AgentContext;
use crate::errors::AgentError;
use crate::notify::TaskStatus;
use crate::pipeline::{StepRunner, TaskKind, TaskSpec};
use crate::steps::web;
use crate::tasks::logstore::TaskLogStore;

pub struct WebPipeline {
    ctx: Arc<AgentContext>,
    logger: Arc<TaskLogStore>,
    runner: StepRunner,
}

impl WebPipeline {
    pub fn new(
        ctx: Arc<AgentContext>,
        spec: TaskSpec,
        cancel: CancellationToken,
        logger: Arc<TaskLogStore>,
    ) -> Self {
        // Web projects have no version ledger: no history, no ETA.
        let runner = StepRunner::new(ctx.clone(), spec, cancel, None, TaskKind::Web);
        Self { ctx, logger, runner }
    }

    pub async fn run(&self) -> Result<(), AgentError> {
        let spec = self.runner.spec().clone();
        let cancel = self.runner.cancel_token().clone();
        let settings = &self.ctx.settings;

        let product = web::product_name(&spec.project, &spec.category, &spec.tag);
        let web_path = self.ctx.resolver.web_root(&spec.project, &spec.category);
        let backup_path = self.ctx.resolver.web_backup(&spec.project, &spec.category);

        let zip_path = self
            .runner
            .step(7, "downProduct", "download bundle", || {
                web::download_product(
                    &cancel,
                    &self.logger,
                    &self.ctx.http_client,
                    &settings.web.download_url,
                    &settings.web.download_dir,
                    Path::new(web::PRODUCTS_DIR),
                    &product,
                )
            })
            .await?;

        let dist_path = self
            .runner
            .step(8, "extractProduct", "extract bundle", || {
                web::extract_product(&cancel, &self.logger, &zip_path, Path::new(web::EXTRACT_DIR))
            })
            .await?;

        self.runner
            .step(9, "backupCurrent", "back up current version", || {
                web::backup_current(&self.logger, &web_path, &backup_path)
            })
            .await?;

        let deploy_result = self
            .runner
            .step(10, "deployNew", "deploy new version", || {
                web::deploy_new(&self.logger, &dist_path, &web_path)
            })
            .await;

        if let Err(e) = deploy_result {
            if !e.is_cancelled() {
                if let Err(rollback) =
                    web::restore_backup(&self.logger, &backup_path, &web_path).await
                {
                    error!("rollback failed: {}", rollback);
                }
                web::cleanup_temp_files(&self.logger, &zip_path, Path::new(web::EXTRACT_DIR)).await;
            }
            return Err(e);
        }

        web::cleanup_temp_files(&self.logger, &zip_path, Path::new(web::EXTRACT_DIR)).await;

        self.runner.finish(TaskStatus::Complete).await;
        Ok(())
    }
}
