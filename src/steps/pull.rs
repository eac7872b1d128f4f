//! Image puller (step `pullOnline`).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::AgentError;
use crate::procs::{display_command, run_tool};
use crate::steps::{fanout_concurrency, run_fanout};
use crate::tasks::logstore::TaskLogStore;

const STEP: &str = "pullOnline";

pub struct ImagePuller {
    logger: Arc<TaskLogStore>,
}

impl ImagePuller {
    pub fn new(logger: Arc<TaskLogStore>) -> Self {
        Self { logger }
    }

    /// Remove local images whose repository path contains `/<project>/`.
    /// Best-effort pre-step: individual delete failures are warnings.
    pub async fn clean_project_images(
        &self,
        cancel: &CancellationToken,
        project: &str,
    ) -> Result<(), AgentError> {
        if project.is_empty() {
            return Err(AgentError::ToolError("project name is empty".to_string()));
        }

        self.logger
            .write_step(STEP, "INFO", &format!("cleaning old images for project {}", project));

        let args = ["images", "--format", "{{.Repository}}:{{.Tag}}"];
        let listing = run_tool(cancel, "docker", &args, None).await?;
        self.logger.write_command(
            STEP,
            &display_command("docker", &args),
            &listing.output,
            (!listing.success).then_some("docker images failed"),
        );
        if !listing.success {
            return Err(AgentError::ToolError(format!(
                "failed to list local images: {}",
                listing.text().trim()
            )));
        }

        let needle = format!("/{}/", project);
        let to_delete: Vec<String> = listing
            .text()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != "<none>:<none>" && line.contains(&needle))
            .map(str::to_string)
            .collect();

        if to_delete.is_empty() {
            self.logger.write_step(STEP, "INFO", "no stale images to clean");
            return Ok(());
        }

        let cap = fanout_concurrency(to_delete.len());
        self.logger.write_step(
            STEP,
            "INFO",
            &format!("deleting {} images, concurrency {}", to_delete.len(), cap),
        );

        let jobs: Vec<_> = to_delete
            .into_iter()
            .map(|image| {
                let logger = self.logger.clone();
                let token = cancel.clone();
                async move {
                    let args = ["rmi", "-f", image.as_str()];
                    let out = run_tool(&token, "docker", &args, None).await?;
                    logger.write_command(
                        STEP,
                        &display_command("docker", &args),
                        &out.output,
                        (!out.success).then_some("docker rmi failed"),
                    );
                    if out.success {
                        logger.write_step(STEP, "INFO", &format!("deleted image {}", image));
                    } else {
                        // delete failures do not interrupt the rollout
                        logger.write_step(
                            STEP,
                            "WARNING",
                            &format!("failed to delete image {}", image),
                        );
                    }
                    Ok(())
                }
            })
            .collect();

        run_fanout(cancel, cap, jobs).await?;
        self.logger.write_step(STEP, "INFO", "image cleanup finished");
        Ok(())
    }

    /// Pull every image. On success each referenced image exists locally.
    pub async fn pull_images(
        &self,
        cancel: &CancellationToken,
        images: &[String],
    ) -> Result<(), AgentError> {
        if images.is_empty() {
            return Err(AgentError::ToolError("image list is empty".to_string()));
        }

        let cap = fanout_concurrency(images.len());
        self.logger.write_step(
            STEP,
            "INFO",
            &format!("pulling {} images, concurrency {}", images.len(), cap),
        );

        let jobs: Vec<_> = images
            .iter()
            .cloned()
            .map(|image| {
                let logger = self.logger.clone();
                let token = cancel.clone();
                async move {
                    logger.write_step(STEP, "INFO", &format!("pulling image {}", image));
                    let args = ["pull", image.as_str()];
                    let out = run_tool(&token, "docker", &args, None).await?;
                    logger.write_command(
                        STEP,
                        &display_command("docker", &args),
                        &out.output,
                        (!out.success).then_some("docker pull failed"),
                    );
                    if !out.success {
                        return Err(AgentError::ToolError(format!(
                            "failed to pull image {}: {}",
                            image,
                            out.text().trim()
                        )));
                    }
                    logger.write_step(STEP, "INFO", &format!("pulled image {}", image));
                    Ok(())
                }
            })
            .collect();

        run_fanout(cancel, cap, jobs).await?;

        info!("pulled {} images", images.len());
        self.logger
            .write_step(STEP, "INFO", &format!("all {} images pulled", images.len()));
        Ok(())
    }
}
