//! Manifest applier (step `deployService`).
//!
//! Rewrites the image tag in every manifest under the deployment directory,
//! then applies the directory through the orchestrator CLI. Projects whose
//! name contains `risk` and that carry a category apply a single manifest
//! instead of the whole directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::errors::AgentError;
use crate::procs::{display_command, run_tool};
use crate::steps::run_fanout;
use crate::tasks::logstore::TaskLogStore;

const STEP: &str = "deployService";
const REWRITE_CONCURRENCY: usize = 5;

pub struct ServiceDeployer {
    settings: Arc<Settings>,
    logger: Arc<TaskLogStore>,
}

impl ServiceDeployer {
    pub fn new(settings: Arc<Settings>, logger: Arc<TaskLogStore>) -> Self {
        Self { settings, logger }
    }

    pub async fn deploy(
        &self,
        cancel: &CancellationToken,
        deploy_dir: &Path,
        project: &str,
        tag: &str,
        category: &str,
    ) -> Result<(), AgentError> {
        let yaml_files = collect_yaml_files(deploy_dir).await?;
        if yaml_files.is_empty() {
            self.logger
                .write_step(STEP, "INFO", "no manifest files found, nothing to deploy");
            return Ok(());
        }

        self.logger.write_step(
            STEP,
            "INFO",
            &format!("rewriting tags in {} manifest files", yaml_files.len()),
        );

        let offline = self.settings.registry.offline.clone();
        let jobs: Vec<_> = yaml_files
            .into_iter()
            .map(|file| {
                let logger = self.logger.clone();
                let offline = offline.clone();
                let project = project.to_string();
                let tag = tag.to_string();
                async move { rewrite_manifest(&logger, &file, &offline, &project, &tag).await }
            })
            .collect();

        run_fanout(cancel, REWRITE_CONCURRENCY, jobs).await?;
        self.logger.write_step(STEP, "INFO", "manifest rewrite finished");

        self.apply(cancel, deploy_dir, project, category).await
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        deploy_dir: &Path,
        project: &str,
        category: &str,
    ) -> Result<(), AgentError> {
        // Risk projects with a category apply exactly one manifest.
        let target = if project.contains("risk") && !category.is_empty() {
            let file = format!("bxhd-risk-{}.yaml", category);
            if !deploy_dir.join(&file).exists() {
                return Err(AgentError::DeployError(format!(
                    "service manifest does not exist: {}",
                    deploy_dir.join(&file).display()
                )));
            }
            self.logger
                .write_step(STEP, "INFO", &format!("applying single manifest {}", file));
            file
        } else {
            self.logger
                .write_step(STEP, "INFO", "applying all manifests in directory");
            ".".to_string()
        };

        let args = ["apply", "-f", target.as_str()];
        let out = run_tool(cancel, "kubectl", &args, Some(deploy_dir)).await?;
        self.logger.write_command(
            STEP,
            &display_command("kubectl", &args),
            &out.output,
            (!out.success).then_some("kubectl apply failed"),
        );
        if !out.success {
            return Err(AgentError::DeployError(format!(
                "kubectl apply failed: {}",
                out.text().trim()
            )));
        }

        self.logger.write_step(STEP, "INFO", "kubectl apply succeeded");
        Ok(())
    }
}

/// Recursively collect `.yaml`/`.yml` files under a directory.
async fn collect_yaml_files(root: &Path) -> Result<Vec<PathBuf>, AgentError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            AgentError::DeployError(format!("failed to read {}: {}", dir.display(), e))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Rewrite `image: <offline>/<project>/<service>:<old>` lines to the new
/// tag. Files without a matching line are left untouched; changed files are
/// replaced atomically.
async fn rewrite_manifest(
    logger: &TaskLogStore,
    file: &Path,
    offline_registry: &str,
    project: &str,
    new_tag: &str,
) -> Result<(), AgentError> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| AgentError::DeployError(format!("failed to read {}: {}", file.display(), e)))?;

    let mut changed = false;
    let mut lines = Vec::new();
    for line in contents.lines() {
        match rewrite_image_line(line, offline_registry, project, new_tag) {
            Some((new_line, old_tag)) => {
                logger.write_step(
                    STEP,
                    "INFO",
                    &format!(
                        "{}: image tag {} -> {}",
                        file.file_name().unwrap_or_default().to_string_lossy(),
                        old_tag,
                        new_tag
                    ),
                );
                lines.push(new_line);
                changed = true;
            }
            None => lines.push(line.to_string()),
        }
    }

    if !changed {
        return Ok(());
    }

    let mut body = lines.join("\n");
    if contents.ends_with('\n') {
        body.push('\n');
    }

    let temp = file.with_extension("yaml.tmp");
    tokio::fs::write(&temp, body.as_bytes()).await?;
    tokio::fs::rename(&temp, file).await?;
    Ok(())
}

/// Match a manifest image line for this project in the offline registry and
/// return the rewritten line plus the old tag. `None` when the line does not
/// match or already carries the new tag.
fn rewrite_image_line(
    line: &str,
    offline_registry: &str,
    project: &str,
    new_tag: &str,
) -> Option<(String, String)> {
    let key_idx = line.find("image:")?;
    if !line[..key_idx].chars().all(char::is_whitespace) {
        return None;
    }

    let after_key = &line[key_idx + "image:".len()..];
    let value = after_key.trim();
    let prefix_len = line.len() - after_key.trim_start().len();

    let repo_prefix = format!("{}/{}/", offline_registry, project);
    let rest = value.strip_prefix(repo_prefix.as_str())?;
    let (service, old_tag) = rest.split_once(':')?;
    if service.is_empty() || service.contains('/') || old_tag.is_empty() {
        return None;
    }
    if old_tag == new_tag {
        return None;
    }

    Some((
        format!("{}{}{}:{}", &line[..prefix_len], repo_prefix, service, new_tag),
        old_tag.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_image_line_matches() {
        let line = "    image: hub.offline.example/p/gateway:1.0.0";
        let (new_line, old_tag) =
            rewrite_image_line(line, "hub.offline.example", "p", "2.0.0").unwrap();
        assert_eq!(new_line, "    image: hub.offline.example/p/gateway:2.0.0");
        assert_eq!(old_tag, "1.0.0");
    }

    #[test]
    fn test_rewrite_preserves_indentation() {
        let line = "\t  image:   hub/p/api:old";
        let (new_line, _) = rewrite_image_line(line, "hub", "p", "new").unwrap();
        assert_eq!(new_line, "\t  image:   hub/p/api:new");
    }

    #[test]
    fn test_rewrite_ignores_other_projects_and_registries() {
        assert!(rewrite_image_line("  image: hub/other/api:1", "hub", "p", "2").is_none());
        assert!(rewrite_image_line("  image: wrong-hub/p/api:1", "hub", "p", "2").is_none());
        assert!(rewrite_image_line("  # image: hub/p/api:1", "hub", "p", "2").is_none());
        assert!(rewrite_image_line("  imagePullPolicy: Always", "hub", "p", "2").is_none());
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let line = "  image: hub/p/api:2.0.0";
        assert!(rewrite_image_line(line, "hub", "p", "2.0.0").is_none());
    }

    #[tokio::test]
    async fn test_rewrite_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("svc.yaml");
        std::fs::write(
            &file,
            "kind: Deployment\nspec:\n  template:\n    spec:\n      containers:\n        - image: hub/p/api:1.0\n",
        )
        .unwrap();

        let logger = TaskLogStore::new_in(dir.path(), "t");
        rewrite_manifest(&logger, &file, "hub", "p", "1.1")
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&file).unwrap();
        assert!(contents.contains("image: hub/p/api:1.1"));
        assert!(!contents.contains(":1.0"));
        assert!(contents.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_rewrite_manifest_untouched_when_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg.yaml");
        std::fs::write(&file, "kind: ConfigMap\ndata:\n  a: b\n").unwrap();
        let before = std::fs::metadata(&file).unwrap().modified().unwrap();

        let logger = TaskLogStore::new_in(dir.path(), "t");
        rewrite_manifest(&logger, &file, "hub", "p", "1.1")
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&file).unwrap().modified().unwrap(), before);
    }

    #[tokio::test]
    async fn test_collect_yaml_files_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.yml"), "x").unwrap();
        std::fs::write(dir.path().join("sub/notes.txt"), "x").unwrap();

        let files = collect_yaml_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);
    }
}
