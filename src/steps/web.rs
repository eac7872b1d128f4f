//! Front-end bundle steps (`downProduct`, `extractProduct`, `backupCurrent`,
//! `deployNew`).
//!
//! A web rollout fetches the built bundle, unpacks it, swings the live
//! directory aside as a backup, and renames the new tree into place. The
//! pipeline restores the backup when the final step fails.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::AgentError;
use crate::tasks::logstore::TaskLogStore;

/// Scratch location for downloaded bundles.
pub const PRODUCTS_DIR: &str = "/tmp/web-products";
/// Scratch location for extraction.
pub const EXTRACT_DIR: &str = "/tmp/web-extract";

const DIST_SEARCH_DEPTH: usize = 2;

/// Bundle file name: `<project>[-<category>]-<tag>.zip`.
pub fn product_name(project: &str, category: &str, tag: &str) -> String {
    if category.is_empty() {
        format!("{}-{}.zip", project, tag)
    } else {
        format!("{}-{}-{}.zip", project, category, tag)
    }
}

/// Step `downProduct`: fetch the bundle into the products directory.
pub async fn download_product(
    cancel: &CancellationToken,
    logger: &TaskLogStore,
    client: &reqwest::Client,
    download_url: &str,
    download_dir: &str,
    products_dir: &Path,
    product: &str,
) -> Result<PathBuf, AgentError> {
    const STEP: &str = "downProduct";

    let url = format!("{}/{}/{}", download_url, download_dir, product);
    logger.write_step(STEP, "INFO", &format!("downloading bundle {}", url));

    let request = client.get(&url).send();
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        resp = request => resp,
    };
    let resp = response
        .map_err(|e| AgentError::ToolError(format!("bundle download failed: {}", e)))?;

    if resp.status() != reqwest::StatusCode::OK {
        logger.write_step(
            STEP,
            "ERROR",
            &format!("bundle download answered {}", resp.status().as_u16()),
        );
        return Err(AgentError::ToolError(format!(
            "bundle download failed with status {}",
            resp.status().as_u16()
        )));
    }

    let body = tokio::select! {
        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        bytes = resp.bytes() => bytes
            .map_err(|e| AgentError::ToolError(format!("bundle download interrupted: {}", e)))?,
    };

    tokio::fs::create_dir_all(products_dir).await?;
    let local_path = products_dir.join(product);
    tokio::fs::write(&local_path, &body).await?;

    logger.write_step(
        STEP,
        "INFO",
        &format!("bundle saved to {} ({} bytes)", local_path.display(), body.len()),
    );
    Ok(local_path)
}

/// Step `extractProduct`: unpack the bundle and locate the tree to deploy.
///
/// Returns the `dist` directory when the archive carries one (searched up to
/// two levels deep), otherwise the extraction root.
pub async fn extract_product(
    cancel: &CancellationToken,
    logger: &TaskLogStore,
    zip_path: &Path,
    extract_dir: &Path,
) -> Result<PathBuf, AgentError> {
    const STEP: &str = "extractProduct";

    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }
    if tokio::fs::metadata(zip_path).await.is_err() {
        return Err(AgentError::ToolError(format!(
            "bundle file does not exist: {}",
            zip_path.display()
        )));
    }

    let _ = tokio::fs::remove_dir_all(extract_dir).await;
    tokio::fs::create_dir_all(extract_dir).await?;

    let zip_path_owned = zip_path.to_path_buf();
    let extract_dir_owned = extract_dir.to_path_buf();
    let extracted = tokio::task::spawn_blocking(move || {
        unzip_archive(&zip_path_owned, &extract_dir_owned)
    })
    .await
    .map_err(|e| AgentError::Internal(format!("extraction task failed: {}", e)))??;

    logger.write_step(
        STEP,
        "INFO",
        &format!("extracted {} entries to {}", extracted, extract_dir.display()),
    );

    let dist = find_dist_dir(extract_dir, DIST_SEARCH_DEPTH)
        .await
        .unwrap_or_else(|| extract_dir.to_path_buf());
    logger.write_step(STEP, "INFO", &format!("deploy source is {}", dist.display()));
    Ok(dist)
}

fn unzip_archive(zip_path: &Path, dest: &Path) -> Result<usize, AgentError> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| AgentError::ToolError(format!("failed to open bundle archive: {}", e)))?;

    let mut extracted = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| AgentError::ToolError(format!("failed to read archive entry: {}", e)))?;

        // path traversal guard: entries escaping the destination are skipped
        let Some(relative) = entry.enclosed_name() else {
            warn!("skipping unsafe archive path: {}", entry.name());
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
        }
        extracted += 1;
    }
    Ok(extracted)
}

/// Breadth-limited search for a `dist` directory.
async fn find_dist_dir(root: &Path, depth: usize) -> Option<PathBuf> {
    let direct = root.join("dist");
    if tokio::fs::metadata(&direct).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Some(direct);
    }
    if depth == 0 {
        return None;
    }

    let mut entries = tokio::fs::read_dir(root).await.ok()?;
    let mut subdirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.ok()? {
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|n| n == "dist") {
                return Some(path);
            }
            subdirs.push(path);
        }
    }

    for subdir in subdirs {
        if let Some(found) = Box::pin(find_dist_dir(&subdir, depth - 1)).await {
            return Some(found);
        }
    }
    None
}

/// Step `backupCurrent`: move the live web directory aside, replacing any
/// previous backup. A missing live directory is a no-op (first deployment).
pub async fn backup_current(
    logger: &TaskLogStore,
    web_path: &Path,
    backup_path: &Path,
) -> Result<(), AgentError> {
    const STEP: &str = "backupCurrent";

    logger.write_step(
        STEP,
        "INFO",
        &format!("backing up {} -> {}", web_path.display(), backup_path.display()),
    );

    if tokio::fs::metadata(backup_path).await.is_ok() {
        logger.write_step(STEP, "INFO", "removing previous backup");
        if let Err(e) = tokio::fs::remove_dir_all(backup_path).await {
            logger.write_step(
                STEP,
                "WARNING",
                &format!("failed to remove previous backup: {}", e),
            );
        }
    }

    if tokio::fs::metadata(web_path).await.is_err() {
        logger.write_step(
            STEP,
            "INFO",
            "live web directory does not exist, skipping backup (first deployment)",
        );
        return Ok(());
    }

    if let Some(parent) = backup_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(web_path, backup_path)
        .await
        .map_err(|e| AgentError::ToolError(format!("failed to back up web directory: {}", e)))?;

    logger.write_step(STEP, "INFO", "backup complete");
    Ok(())
}

/// Step `deployNew`: move the extracted tree into place. Rename first; a
/// cross-filesystem rename falls back to copy + remove. The result must be a
/// non-empty directory.
pub async fn deploy_new(
    logger: &TaskLogStore,
    dist_path: &Path,
    web_path: &Path,
) -> Result<(), AgentError> {
    const STEP: &str = "deployNew";

    if tokio::fs::metadata(dist_path).await.is_err() {
        return Err(AgentError::DeployError(format!(
            "deploy source does not exist: {}",
            dist_path.display()
        )));
    }

    logger.write_step(
        STEP,
        "INFO",
        &format!("deploying {} -> {}", dist_path.display(), web_path.display()),
    );

    if let Some(parent) = web_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(web_path).await.is_ok() {
        tokio::fs::remove_dir_all(web_path)
            .await
            .map_err(|e| AgentError::DeployError(format!("failed to clear target: {}", e)))?;
    }

    if tokio::fs::rename(dist_path, web_path).await.is_err() {
        logger.write_step(STEP, "INFO", "rename crossed filesystems, copying instead");
        let src = dist_path.to_path_buf();
        let dst = web_path.to_path_buf();
        tokio::task::spawn_blocking(move || copy_dir_all(&src, &dst))
            .await
            .map_err(|e| AgentError::Internal(format!("copy task failed: {}", e)))?
            .map_err(|e| AgentError::DeployError(format!("failed to copy web tree: {}", e)))?;
        if let Err(e) = tokio::fs::remove_dir_all(dist_path).await {
            logger.write_step(STEP, "WARNING", &format!("failed to remove source tree: {}", e));
        }
    }

    // the deployed tree must exist and carry content
    let mut entries = tokio::fs::read_dir(web_path)
        .await
        .map_err(|e| AgentError::DeployError(format!("deployed directory unreadable: {}", e)))?;
    if entries.next_entry().await?.is_none() {
        return Err(AgentError::DeployError(format!(
            "deployed directory is empty: {}",
            web_path.display()
        )));
    }

    logger.write_step(STEP, "INFO", "new version deployed");
    Ok(())
}

/// Roll a failed deployment back by restoring the backup.
pub async fn restore_backup(
    logger: &TaskLogStore,
    backup_path: &Path,
    web_path: &Path,
) -> Result<(), AgentError> {
    const STEP: &str = "deployNew";

    logger.write_step(
        STEP,
        "INFO",
        &format!("restoring backup {} -> {}", backup_path.display(), web_path.display()),
    );

    if tokio::fs::metadata(backup_path).await.is_err() {
        return Err(AgentError::DeployError(format!(
            "backup does not exist, cannot roll back: {}",
            backup_path.display()
        )));
    }

    if let Err(e) = tokio::fs::remove_dir_all(web_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            logger.write_step(
                STEP,
                "WARNING",
                &format!("failed to remove broken deployment: {}", e),
            );
        }
    }

    tokio::fs::rename(backup_path, web_path)
        .await
        .map_err(|e| AgentError::DeployError(format!("failed to restore backup: {}", e)))?;
    logger.write_step(STEP, "INFO", "rollback complete");
    Ok(())
}

/// Remove the downloaded bundle and the extraction scratch tree.
pub async fn cleanup_temp_files(logger: &TaskLogStore, zip_path: &Path, extract_dir: &Path) {
    const STEP: &str = "deployNew";

    if let Err(e) = tokio::fs::remove_file(zip_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            logger.write_step(STEP, "WARNING", &format!("failed to remove bundle: {}", e));
        }
    }
    if let Err(e) = tokio::fs::remove_dir_all(extract_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            logger.write_step(
                STEP,
                "WARNING",
                &format!("failed to remove extraction directory: {}", e),
            );
        }
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_logger(dir: &Path) -> TaskLogStore {
        TaskLogStore::new_in(dir, "web-test")
    }

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_product_name() {
        assert_eq!(product_name("ysh-web", "", "1.2.3"), "ysh-web-1.2.3.zip");
        assert_eq!(
            product_name("ysh-web", "manager", "1.2.3"),
            "ysh-web-manager-1.2.3.zip"
        );
    }

    #[tokio::test]
    async fn test_extract_finds_nested_dist() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bundle.zip");
        write_zip(
            &zip_path,
            &[
                ("build/", ""),
                ("build/dist/", ""),
                ("build/dist/index.html", "<html></html>"),
            ],
        );

        let logger = test_logger(dir.path());
        let extract_dir = dir.path().join("extract");
        let cancel = CancellationToken::new();
        let dist = extract_product(&cancel, &logger, &zip_path, &extract_dir)
            .await
            .unwrap();

        assert_eq!(dist, extract_dir.join("build").join("dist"));
        assert!(dist.join("index.html").exists());
    }

    #[tokio::test]
    async fn test_extract_falls_back_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bundle.zip");
        write_zip(&zip_path, &[("index.html", "<html></html>")]);

        let logger = test_logger(dir.path());
        let extract_dir = dir.path().join("extract");
        let cancel = CancellationToken::new();
        let dist = extract_product(&cancel, &logger, &zip_path, &extract_dir)
            .await
            .unwrap();

        assert_eq!(dist, extract_dir);
    }

    #[tokio::test]
    async fn test_backup_and_deploy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(dir.path());

        let web = dir.path().join("www/site/web");
        std::fs::create_dir_all(&web).unwrap();
        std::fs::write(web.join("old.html"), "old").unwrap();

        let backup = dir.path().join("www/site/web_backup");
        backup_current(&logger, &web, &backup).await.unwrap();
        assert!(!web.exists());
        assert!(backup.join("old.html").exists());

        let dist = dir.path().join("dist");
        std::fs::create_dir_all(&dist).unwrap();
        std::fs::write(dist.join("new.html"), "new").unwrap();

        deploy_new(&logger, &dist, &web).await.unwrap();
        assert!(web.join("new.html").exists());
        assert!(!dist.exists());
    }

    #[tokio::test]
    async fn test_backup_missing_web_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(dir.path());
        backup_current(
            &logger,
            &dir.path().join("absent"),
            &dir.path().join("absent_backup"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_backup_replaces_previous_backup() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(dir.path());

        let web = dir.path().join("web");
        let backup = dir.path().join("web_backup");
        std::fs::create_dir_all(&web).unwrap();
        std::fs::write(web.join("current.html"), "current").unwrap();
        std::fs::create_dir_all(&backup).unwrap();
        std::fs::write(backup.join("stale.html"), "stale").unwrap();

        backup_current(&logger, &web, &backup).await.unwrap();
        assert!(backup.join("current.html").exists());
        assert!(!backup.join("stale.html").exists());
    }

    #[tokio::test]
    async fn test_deploy_empty_tree_fails() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(dir.path());
        let dist = dir.path().join("dist");
        std::fs::create_dir_all(&dist).unwrap();

        let err = deploy_new(&logger, &dist, &dir.path().join("web"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::DeployError(_)));
    }

    #[tokio::test]
    async fn test_restore_backup() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(dir.path());

        let web = dir.path().join("web");
        let backup = dir.path().join("web_backup");
        std::fs::create_dir_all(&web).unwrap();
        std::fs::write(web.join("broken.html"), "broken").unwrap();
        std::fs::create_dir_all(&backup).unwrap();
        std::fs::write(backup.join("good.html"), "good").unwrap();

        restore_backup(&logger, &backup, &web).await.unwrap();
        assert!(web.join("good.html").exists());
        assert!(!web.join("broken.html").exists());
        assert!(!backup.exists());
    }
}
