//! Registry existence check (step `checkImage`).
//!
//! After the push, every artifact must be queryable in the offline registry
//! before any manifest is applied. Refs are deduplicated down to bare
//! service names and probed through the registry's artifact-tags API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Settings;
use crate::errors::AgentError;
use crate::steps::run_fanout;
use crate::tasks::logstore::TaskLogStore;

const STEP: &str = "checkImage";
const MAX_CONCURRENCY: usize = 20;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ImageChecker {
    settings: Arc<Settings>,
    logger: Arc<TaskLogStore>,
    client: reqwest::Client,
}

impl ImageChecker {
    pub fn new(settings: Arc<Settings>, logger: Arc<TaskLogStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            settings,
            logger,
            client,
        }
    }

    /// Success iff every service's artifact answers 200 for the tag.
    /// Anything else fails the step naming the missing services.
    pub async fn check_images(
        &self,
        cancel: &CancellationToken,
        images: &[String],
        project: &str,
        tag: &str,
    ) -> Result<(), AgentError> {
        if images.is_empty() {
            self.logger.write_step(STEP, "INFO", "no images to check");
            return Ok(());
        }

        let services = dedupe_service_names(images);
        let cap = services.len().min(MAX_CONCURRENCY);
        self.logger.write_step(
            STEP,
            "INFO",
            &format!(
                "checking {} artifacts in registry, concurrency {}",
                services.len(),
                cap
            ),
        );

        let missing: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let jobs: Vec<_> = services
            .iter()
            .cloned()
            .map(|service| {
                let checker_client = self.client.clone();
                let settings = self.settings.clone();
                let logger = self.logger.clone();
                let missing = missing.clone();
                let token = cancel.clone();
                let project = project.to_string();
                let tag = tag.to_string();
                async move {
                    let exists = check_one(
                        &token,
                        &checker_client,
                        &settings,
                        &logger,
                        &project,
                        &service,
                        &tag,
                    )
                    .await?;
                    if !exists {
                        missing.lock().unwrap().push(service);
                    }
                    Ok(())
                }
            })
            .collect();

        run_fanout(cancel, cap.max(1), jobs).await?;

        let mut missing = Arc::try_unwrap(missing)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();
        missing.sort();

        if !missing.is_empty() {
            self.logger.write_step(
                STEP,
                "ERROR",
                &format!("artifacts missing from registry: {}", missing.join(", ")),
            );
            return Err(AgentError::RegistryError(format!(
                "artifacts missing from registry: {}",
                missing.join(", ")
            )));
        }

        self.logger
            .write_step(STEP, "INFO", "all artifacts present in registry");
        Ok(())
    }
}

async fn check_one(
    cancel: &CancellationToken,
    client: &reqwest::Client,
    settings: &Settings,
    logger: &TaskLogStore,
    project: &str,
    service: &str,
    tag: &str,
) -> Result<bool, AgentError> {
    let url = format!(
        "https://{}/api/v2.0/projects/{}/repositories/{}/artifacts/{}/tags",
        settings.registry.offline, project, service, tag
    );
    logger.write_step(STEP, "INFO", &format!("checking artifact {}", url));

    let request = client
        .get(&url)
        .basic_auth(
            &settings.registry.offline_user,
            Some(&settings.registry.offline_password),
        )
        .send();

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        resp = request => resp,
    };

    match response {
        Ok(resp) => {
            let exists = resp.status() == reqwest::StatusCode::OK;
            logger.write_step(
                STEP,
                if exists { "INFO" } else { "WARNING" },
                &format!(
                    "artifact {}/{}:{} exists={} (status {})",
                    project,
                    service,
                    tag,
                    exists,
                    resp.status().as_u16()
                ),
            );
            Ok(exists)
        }
        Err(e) => {
            warn!("registry query for {} failed: {}", service, e);
            logger.write_step(
                STEP,
                "ERROR",
                &format!("registry query for {} failed: {}", service, e),
            );
            Ok(false)
        }
    }
}

/// Reduce full refs (`registry/project/service:tag`) to unique bare service
/// names, preserving first-seen order.
fn dedupe_service_names(images: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for image in images {
        let name = image.rsplit('/').next().unwrap_or(image);
        let name = name.split(':').next().unwrap_or(name);
        if seen.insert(name.to_string()) {
            names.push(name.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_service_names() {
        let images = vec![
            "hub.example/p/gateway:1.0".to_string(),
            "hub.example/p/api:1.0".to_string(),
            "other.example/p/gateway:2.0".to_string(),
            "bare-name".to_string(),
        ];
        assert_eq!(
            dedupe_service_names(&images),
            vec!["gateway", "api", "bare-name"]
        );
    }
}
