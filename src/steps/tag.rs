//! Image retagger (step `tagImages`).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::errors::AgentError;
use crate::procs::{display_command, run_tool};
use crate::steps::{fanout_concurrency, run_fanout};
use crate::tasks::logstore::TaskLogStore;

const STEP: &str = "tagImages";

/// Retag every online image to its offline counterpart. The two lists must
/// be pairwise equal length.
pub async fn tag_images(
    cancel: &CancellationToken,
    logger: Arc<TaskLogStore>,
    online: &[String],
    offline: &[String],
) -> Result<(), AgentError> {
    if online.len() != offline.len() {
        return Err(AgentError::ToolError(format!(
            "online/offline image count mismatch: {} vs {}",
            online.len(),
            offline.len()
        )));
    }

    logger.write_step(STEP, "INFO", &format!("tagging {} images", online.len()));

    let cap = fanout_concurrency(online.len());
    let jobs: Vec<_> = online
        .iter()
        .cloned()
        .zip(offline.iter().cloned())
        .map(|(src, dst)| {
            let logger = logger.clone();
            let token = cancel.clone();
            async move {
                logger.write_step(STEP, "INFO", &format!("tagging {} -> {}", src, dst));
                let args = ["tag", src.as_str(), dst.as_str()];
                let out = run_tool(&token, "docker", &args, None).await?;
                logger.write_command(
                    STEP,
                    &display_command("docker", &args),
                    &out.output,
                    (!out.success).then_some("docker tag failed"),
                );
                if !out.success {
                    return Err(AgentError::ToolError(format!(
                        "failed to tag {} -> {}: {}",
                        src,
                        dst,
                        out.text().trim()
                    )));
                }
                Ok(())
            }
        })
        .collect();

    run_fanout(cancel, cap, jobs).await?;
    logger.write_step(STEP, "INFO", "image tagging finished");
    Ok(())
}
