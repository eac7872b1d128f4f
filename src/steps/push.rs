//! Image pusher (step `pushLocal`).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::errors::AgentError;
use crate::procs::{display_command, run_tool};
use crate::steps::{fanout_concurrency, run_fanout};
use crate::tasks::logstore::TaskLogStore;

const STEP: &str = "pushLocal";

pub struct ImagePusher {
    logger: Arc<TaskLogStore>,
}

impl ImagePusher {
    pub fn new(logger: Arc<TaskLogStore>) -> Self {
        Self { logger }
    }

    /// Push every offline image. An empty list is a successful no-op.
    pub async fn push_images(
        &self,
        cancel: &CancellationToken,
        images: &[String],
    ) -> Result<(), AgentError> {
        if images.is_empty() {
            self.logger.write_step(STEP, "INFO", "no images to push");
            return Ok(());
        }

        let cap = fanout_concurrency(images.len());
        self.logger.write_step(
            STEP,
            "INFO",
            &format!("pushing {} images, concurrency {}", images.len(), cap),
        );

        let jobs: Vec<_> = images
            .iter()
            .cloned()
            .map(|image| {
                let logger = self.logger.clone();
                let token = cancel.clone();
                async move {
                    logger.write_step(STEP, "INFO", &format!("pushing image {}", image));
                    let args = ["push", image.as_str()];
                    let out = run_tool(&token, "docker", &args, None).await?;
                    logger.write_command(
                        STEP,
                        &display_command("docker", &args),
                        &out.output,
                        (!out.success).then_some("docker push failed"),
                    );
                    if !out.success {
                        return Err(AgentError::ToolError(format!(
                            "failed to push image {}: {}",
                            image,
                            out.text().trim()
                        )));
                    }
                    logger.write_step(STEP, "INFO", &format!("pushed image {}", image));
                    Ok(())
                }
            })
            .collect();

        run_fanout(cancel, cap, jobs).await?;
        self.logger
            .write_step(STEP, "INFO", &format!("all {} images pushed", images.len()));
        Ok(())
    }
}
