//! Namespace, deployment-path and image-reference derivation.
//!
//! Pure functions over project name and the live blue/green colour. The only
//! I/O is reading the version ledger (and scanning a deployment directory
//! for service names).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Settings;
use crate::errors::AgentError;
use crate::version::{Colour, VersionLedger};

/// Which colour of a blue/green project a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The colour currently receiving traffic.
    Now,
    /// The colour the next rollout is applied to.
    Next,
}

/// Resolver over configuration and the version ledger.
pub struct Resolver {
    settings: Arc<Settings>,
    ledger: Arc<VersionLedger>,
}

impl Resolver {
    pub fn new(settings: Arc<Settings>, ledger: Arc<VersionLedger>) -> Self {
        Self { settings, ledger }
    }

    fn base_dir(&self, project: &str) -> Result<PathBuf, AgentError> {
        self.settings
            .project_base(project)
            .map(PathBuf::from)
            .ok_or_else(|| {
                AgentError::ConfigError(format!("no deployment directory configured for {}", project))
            })
    }

    /// Target colour for a blue/green project. `Next` resolves to v1 when no
    /// ledger file exists yet; otherwise it is the opposite of the live one.
    pub async fn colour(&self, project: &str, mode: Mode) -> Result<Colour, AgentError> {
        let base = self.base_dir(project)?;
        let live = self.ledger.peek(&base).await?.map(|r| r.current_version);
        Ok(match (mode, live) {
            (Mode::Now, live) => live.unwrap_or(Colour::V1),
            (Mode::Next, None) => Colour::V1,
            (Mode::Next, Some(live)) => live.opposite(),
        })
    }

    /// Orchestrator namespace for a project and mode.
    pub async fn namespace(&self, project: &str, mode: Mode) -> Result<String, AgentError> {
        if !self.settings.is_double_project(project) {
            return Ok(format!("{}-service", project));
        }
        let colour = self.colour(project, mode).await?;
        Ok(format!("{}-service-{}", project, colour))
    }

    /// Manifest directory for a project and mode.
    pub async fn deployment_dir(&self, project: &str, mode: Mode) -> Result<PathBuf, AgentError> {
        let base = self.base_dir(project)?;
        if !self.settings.is_double_project(project) {
            return Ok(base.join("deployment"));
        }
        let colour = self.colour(project, mode).await?;
        Ok(base.join(format!("deployment-{}", colour)))
    }

    /// Project base directory (ledger location).
    pub fn project_base(&self, project: &str) -> Result<PathBuf, AgentError> {
        self.base_dir(project)
    }

    /// Fully-qualified refs in the online (source) registry.
    pub fn online_images(&self, project: &str, tag: &str, services: &[String]) -> Vec<String> {
        Self::image_refs(&self.settings.registry.online, project, tag, services)
    }

    /// Fully-qualified refs in the offline (destination) registry.
    pub fn offline_images(&self, project: &str, tag: &str, services: &[String]) -> Vec<String> {
        Self::image_refs(&self.settings.registry.offline, project, tag, services)
    }

    fn image_refs(registry: &str, project: &str, tag: &str, services: &[String]) -> Vec<String> {
        services
            .iter()
            .map(|svc| format!("{}/{}/{}:{}", registry, project, svc, tag))
            .collect()
    }

    /// Service names found in a deployment directory: yaml file stems, plus
    /// subdirectories that carry a docker-compose file.
    pub async fn services(&self, deploy_dir: &Path) -> Result<Vec<String>, AgentError> {
        let mut services = Vec::new();
        let mut entries = tokio::fs::read_dir(deploy_dir).await.map_err(|e| {
            AgentError::DeployError(format!(
                "failed to read deployment directory {}: {}",
                deploy_dir.display(),
                e
            ))
        })?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if path.is_dir() {
                for compose in ["docker-compose.yml", "docker-compose.yaml"] {
                    if path.join(compose).exists() {
                        services.push(name.clone());
                        break;
                    }
                }
            } else if let Some(stem) = yaml_stem(&name) {
                services.push(stem.to_string());
            }
        }

        if services.is_empty() {
            return Err(AgentError::DeployError(format!(
                "no services found in deployment directory {}",
                deploy_dir.display()
            )));
        }
        services.sort();
        Ok(services)
    }

    /// Live web directory for a front-end project: `/www/<stem>/web`, or the
    /// category sibling (`/www/<stem>/<category>`) when a category is set.
    pub fn web_root(&self, project: &str, category: &str) -> PathBuf {
        let base = PathBuf::from(self.settings.web_path(project));
        if category.is_empty() {
            base
        } else {
            base.parent()
                .map(|p| p.join(category))
                .unwrap_or_else(|| PathBuf::from(category))
        }
    }

    /// Backup sibling of a web directory.
    pub fn web_backup(&self, project: &str, category: &str) -> PathBuf {
        let root = self.web_root(project, category);
        let mut name = root.file_name().unwrap_or_default().to_os_string();
        name.push("_backup");
        root.with_file_name(name)
    }
}

fn yaml_stem(name: &str) -> Option<&str> {
    name.strip_suffix(".yaml").or_else(|| name.strip_suffix(".yml"))
}
