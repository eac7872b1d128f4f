//! Traffic switcher (step `trafficSwitching`).
//!
//! Two modes, decided by configuration. Proxy mode POSTs the target colour
//! to every configured proxy endpoint. Nginx mode rewrites the gateway
//! address in every conf file, verifies the rewrite landed, and dispatches
//! an asynchronous `nginx -s reload` over SSH. Advancing the live colour in
//! the version ledger is the pipeline's job, not the switcher's.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::errors::AgentError;
use crate::procs::{display_command, run_tool};
use crate::tasks::logstore::TaskLogStore;
use crate::version::Colour;

const STEP: &str = "trafficSwitching";
const PROXY_TIMEOUT: Duration = Duration::from_secs(30);
const GATEWAY_PORT: u16 = 8080;

pub struct TrafficSwitcher {
    settings: Arc<Settings>,
    logger: Arc<TaskLogStore>,
    client: reqwest::Client,
}

impl TrafficSwitcher {
    pub fn new(settings: Arc<Settings>, logger: Arc<TaskLogStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROXY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            settings,
            logger,
            client,
        }
    }

    pub async fn switch(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        project: &str,
        target: Colour,
    ) -> Result<(), AgentError> {
        self.logger.write_step(
            STEP,
            "INFO",
            &format!("switching traffic to version {}", target),
        );

        if self.settings.traffic_proxy.enable {
            self.logger
                .write_step(STEP, "INFO", "traffic proxy enabled, switching via proxy");
            self.proxy_switch(cancel, project, target).await
        } else {
            self.logger
                .write_step(STEP, "INFO", "switching via nginx upstream rewrite");
            self.nginx_switch(cancel, namespace, project).await
        }
    }

    /// Proxy mode: all endpoints in parallel, any non-200 fails the step.
    async fn proxy_switch(
        &self,
        cancel: &CancellationToken,
        project: &str,
        target: Colour,
    ) -> Result<(), AgentError> {
        let endpoints = self.settings.proxy_endpoints(project);
        if endpoints.is_empty() {
            self.logger.write_step(
                STEP,
                "WARNING",
                &format!("no proxy endpoints configured for {}, skipping switch", project),
            );
            return Ok(());
        }

        self.logger.write_step(
            STEP,
            "INFO",
            &format!("switching {} proxy endpoints", endpoints.len()),
        );

        let calls = endpoints.iter().map(|endpoint| {
            let client = self.client.clone();
            let logger = self.logger.clone();
            let token = cancel.clone();
            let endpoint = endpoint.clone();
            async move { call_proxy_switch(&token, &client, &logger, &endpoint, target).await }
        });

        let mut failures = Vec::new();
        for result in futures::future::join_all(calls).await {
            match result {
                Ok(()) => {}
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => failures.push(e.to_string()),
            }
        }

        if !failures.is_empty() {
            for failure in &failures {
                self.logger.write_step(STEP, "ERROR", failure);
            }
            return Err(AgentError::TrafficError(format!(
                "{} proxy endpoints failed to switch",
                failures.len()
            )));
        }

        self.logger.write_step(
            STEP,
            "INFO",
            &format!("all proxy endpoints switched to {}", target),
        );
        Ok(())
    }

    /// Nginx mode: resolve the new gateway address, rewrite and verify every
    /// conf file, then dispatch the reload.
    async fn nginx_switch(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        project: &str,
    ) -> Result<(), AgentError> {
        let gateway_ip = self.gateway_loadbalancer_ip(cancel, namespace, project).await?;
        let new_target = format!("{}:{}", gateway_ip, GATEWAY_PORT);
        self.logger.write_step(
            STEP,
            "INFO",
            &format!("resolved gateway address {}", new_target),
        );

        let conf_dir = PathBuf::from(&self.settings.nginx.conf_dir);
        let conf_files = collect_conf_files(&conf_dir).await?;
        if conf_files.is_empty() {
            return Err(AgentError::TrafficError(format!(
                "no .conf files found under {}",
                conf_dir.display()
            )));
        }

        self.logger.write_step(
            STEP,
            "INFO",
            &format!("rewriting {} nginx conf files", conf_files.len()),
        );
        for file in &conf_files {
            if let Err(e) = rewrite_conf_file(&self.logger, file, &new_target).await {
                self.logger.write_step(
                    STEP,
                    "WARNING",
                    &format!("failed to update {}: {}", file.display(), e),
                );
            }
        }

        self.verify_conf_files(&conf_files, &new_target).await?;
        self.dispatch_nginx_reload();

        self.logger
            .write_step(STEP, "INFO", "traffic switch configuration complete");
        Ok(())
    }

    async fn gateway_loadbalancer_ip(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        project: &str,
    ) -> Result<String, AgentError> {
        let service = format!("{}-gateway", project);
        let args = [
            "get",
            "svc",
            service.as_str(),
            "-n",
            namespace,
            "-o",
            "jsonpath={.status.loadBalancer.ingress[0].ip}",
        ];

        let out = run_tool(cancel, "kubectl", &args, None).await?;
        self.logger.write_command(
            STEP,
            &display_command("kubectl", &args),
            &out.output,
            (!out.success).then_some("kubectl get svc failed"),
        );
        if !out.success {
            return Err(AgentError::TrafficError(format!(
                "failed to query gateway service {}: {}",
                service,
                out.text().trim()
            )));
        }

        let ip = out.text().trim().to_string();
        if ip.is_empty() {
            return Err(AgentError::TrafficError(format!(
                "gateway service {} has no LoadBalancer external IP",
                service
            )));
        }
        Ok(ip)
    }

    /// Every conf file must now carry the new target in one of the rewritten
    /// forms; any miss fails the step before the reload is attempted.
    async fn verify_conf_files(
        &self,
        conf_files: &[PathBuf],
        new_target: &str,
    ) -> Result<(), AgentError> {
        let mut inconsistent = Vec::new();
        for file in conf_files {
            let contents = match tokio::fs::read_to_string(file).await {
                Ok(c) => c,
                Err(e) => {
                    self.logger.write_step(
                        STEP,
                        "WARNING",
                        &format!("failed to re-read {}: {}", file.display(), e),
                    );
                    inconsistent.push(file_label(file));
                    continue;
                }
            };

            if contents.contains(new_target) {
                self.logger.write_step(
                    STEP,
                    "INFO",
                    &format!("{} verified, upstream is {}", file_label(file), new_target),
                );
            } else {
                self.logger.write_step(
                    STEP,
                    "WARNING",
                    &format!("{} does not carry expected target {}", file_label(file), new_target),
                );
                inconsistent.push(file_label(file));
            }
        }

        if !inconsistent.is_empty() {
            return Err(AgentError::TrafficError(format!(
                "nginx config verification failed, {} files missing target {}: {}",
                inconsistent.len(),
                new_target,
                inconsistent.join(", ")
            )));
        }
        self.logger.write_step(
            STEP,
            "INFO",
            &format!("verified {} conf files against {}", conf_files.len(), new_target),
        );
        Ok(())
    }

    /// Fire-and-forget `nginx -s reload` on every configured host. The step
    /// succeeds once the reload is dispatched: the config is already
    /// consistent on disk, so reload failures are operational warnings.
    fn dispatch_nginx_reload(&self) {
        let hosts = self.settings.nginx.reload_hosts.clone();
        if hosts.is_empty() {
            self.logger
                .write_step(STEP, "WARNING", "no nginx reload hosts configured");
            return;
        }

        let user = self.settings.nginx.ssh_user.clone();
        let key_file = self.settings.nginx.ssh_key_file.clone();
        let logger = self.logger.clone();
        self.logger.write_step(
            STEP,
            "INFO",
            &format!("dispatching async nginx reload to {} hosts", hosts.len()),
        );

        tokio::spawn(async move {
            // Independent token: cancelling the task must not abort a reload
            // whose config rewrite already landed.
            let token = CancellationToken::new();
            let mut handles = Vec::with_capacity(hosts.len());
            for host in hosts {
                let token = token.clone();
                let user = user.clone();
                let key_file = key_file.clone();
                handles.push(tokio::spawn(async move {
                    let destination = format!("{}@{}", user, host);
                    let args = [
                        "-i",
                        key_file.as_str(),
                        "-o",
                        "StrictHostKeyChecking=no",
                        "-o",
                        "UserKnownHostsFile=/dev/null",
                        "-o",
                        "ConnectTimeout=10",
                        "-o",
                        "LogLevel=ERROR",
                        destination.as_str(),
                        "nginx -s reload",
                    ];
                    let result = run_tool(&token, "ssh", &args, None).await;
                    (host, result)
                }));
            }

            let mut ok = 0usize;
            let mut failed = 0usize;
            for handle in handles {
                match handle.await {
                    Ok((host, Ok(out))) if out.success => {
                        ok += 1;
                        logger.write_step(STEP, "INFO", &format!("nginx reloaded on {}", host));
                    }
                    Ok((host, Ok(out))) => {
                        failed += 1;
                        logger.write_step(
                            STEP,
                            "ERROR",
                            &format!("nginx reload failed on {}: {}", host, out.text().trim()),
                        );
                    }
                    Ok((host, Err(e))) => {
                        failed += 1;
                        logger.write_step(
                            STEP,
                            "ERROR",
                            &format!("ssh to {} failed: {}", host, e),
                        );
                    }
                    Err(e) => {
                        failed += 1;
                        error!("nginx reload worker panicked: {}", e);
                    }
                }
            }

            if failed > 0 {
                warn!("nginx reload finished with {} failures ({} ok)", failed, ok);
                logger.write_step(
                    STEP,
                    "WARNING",
                    &format!("nginx reload finished: {} ok, {} failed", ok, failed),
                );
            } else {
                info!("nginx reload succeeded on all {} hosts", ok);
                logger.write_step(
                    STEP,
                    "INFO",
                    &format!("nginx reload succeeded on all {} hosts", ok),
                );
            }
        });
    }
}

async fn call_proxy_switch(
    cancel: &CancellationToken,
    client: &reqwest::Client,
    logger: &TaskLogStore,
    endpoint: &str,
    target: Colour,
) -> Result<(), AgentError> {
    let url = format!("{}/switch", endpoint);
    logger.write_step(STEP, "INFO", &format!("calling proxy switch {}", url));

    let body = serde_json::json!({ "version": target.as_str() });
    let request = client.post(&url).json(&body).send();

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        resp = request => resp,
    };

    let resp = response
        .map_err(|e| AgentError::TrafficError(format!("proxy {} request failed: {}", endpoint, e)))?;
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    logger.write_step(
        STEP,
        "INFO",
        &format!("proxy {} answered {}: {}", endpoint, status.as_u16(), text.trim()),
    );

    if status != reqwest::StatusCode::OK {
        return Err(AgentError::TrafficError(format!(
            "proxy {} rejected switch, status {}: {}",
            endpoint,
            status.as_u16(),
            text.trim()
        )));
    }
    Ok(())
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Recursively collect `.conf` files (case-insensitive extension).
async fn collect_conf_files(root: &Path) -> Result<Vec<PathBuf>, AgentError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            AgentError::TrafficError(format!("failed to read {}: {}", dir.display(), e))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("conf"))
            {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

async fn rewrite_conf_file(
    logger: &TaskLogStore,
    file: &Path,
    new_target: &str,
) -> Result<(), AgentError> {
    let contents = tokio::fs::read_to_string(file).await?;
    let (updated, changed) = replace_upstream_targets(&contents, new_target);
    if !changed {
        logger.write_step(
            STEP,
            "INFO",
            &format!("{} has no upstream address, left untouched", file_label(file)),
        );
        return Ok(());
    }

    tokio::fs::write(file, updated.as_bytes()).await?;
    logger.write_step(STEP, "INFO", &format!("updated {}", file_label(file)));
    Ok(())
}

/// Replace every `<ipv4>:8080` occurrence with the new target. This covers
/// the `server`, `proxy_pass http://…;`, `proxy_pass http://…/` and bare
/// address forms in one pass.
fn replace_upstream_targets(content: &str, new_target: &str) -> (String, bool) {
    let bytes = content.as_bytes();
    let port_suffix = format!(":{}", GATEWAY_PORT);
    let mut out = String::with_capacity(content.len());
    let mut idx = 0;
    let mut changed = false;

    while idx < content.len() {
        match content[idx..].find(&port_suffix) {
            None => {
                out.push_str(&content[idx..]);
                break;
            }
            Some(rel) => {
                let colon = idx + rel;
                let end = colon + port_suffix.len();

                // the port must not continue with more digits (":80801")
                let port_boundary = end >= content.len() || !bytes[end].is_ascii_digit();
                let ip_start = ipv4_start(content, colon);

                match (port_boundary, ip_start) {
                    (true, Some(start)) => {
                        out.push_str(&content[idx..start]);
                        out.push_str(new_target);
                        changed = true;
                        idx = end;
                    }
                    _ => {
                        out.push_str(&content[idx..end]);
                        idx = end;
                    }
                }
            }
        }
    }

    (out, changed)
}

/// Walk backwards from `colon` over a dotted-quad address; `None` when the
/// preceding text is not an IPv4 literal.
fn ipv4_start(content: &str, colon: usize) -> Option<usize> {
    let bytes = content.as_bytes();
    let mut start = colon;
    while start > 0 {
        let c = bytes[start - 1];
        if c.is_ascii_digit() || c == b'.' {
            start -= 1;
        } else {
            break;
        }
    }
    if start == colon {
        return None;
    }

    let candidate = &content[start..colon];
    let octets: Vec<&str> = candidate.split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    octets
        .iter()
        .all(|o| !o.is_empty() && o.chars().all(|c| c.is_ascii_digit()))
        .then_some(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_server_directive() {
        let conf = "upstream backend {\n    server 10.0.0.1:8080;\n}\n";
        let (out, changed) = replace_upstream_targets(conf, "10.0.0.9:8080");
        assert!(changed);
        assert!(out.contains("server 10.0.0.9:8080;"));
        assert!(!out.contains("10.0.0.1"));
    }

    #[test]
    fn test_replace_proxy_pass_forms() {
        let conf = concat!(
            "location / {\n",
            "    proxy_pass http://192.168.1.5:8080;\n",
            "}\n",
            "location /api/ {\n",
            "    proxy_pass http://192.168.1.5:8080/;\n",
            "}\n",
        );
        let (out, changed) = replace_upstream_targets(conf, "192.168.1.6:8080");
        assert!(changed);
        assert!(out.contains("proxy_pass http://192.168.1.6:8080;"));
        assert!(out.contains("proxy_pass http://192.168.1.6:8080/;"));
    }

    #[test]
    fn test_replace_leaves_other_ports_alone() {
        let conf = "server 10.0.0.1:9090;\nlisten 8081;\n";
        let (out, changed) = replace_upstream_targets(conf, "10.0.0.9:8080");
        assert!(!changed);
        assert_eq!(out, conf);
    }

    #[test]
    fn test_replace_ignores_longer_port() {
        let conf = "server 10.0.0.1:80801;\n";
        let (_, changed) = replace_upstream_targets(conf, "10.0.0.9:8080");
        assert!(!changed);
    }

    #[test]
    fn test_replace_ignores_hostnames() {
        let conf = "proxy_pass http://backend.svc:8080;\n";
        let (out, changed) = replace_upstream_targets(conf, "10.0.0.9:8080");
        assert!(!changed);
        assert_eq!(out, conf);
    }

    #[test]
    fn test_replace_multiple_occurrences() {
        let conf = "server 1.2.3.4:8080;\nserver 5.6.7.8:8080;\n";
        let (out, changed) = replace_upstream_targets(conf, "9.9.9.9:8080");
        assert!(changed);
        assert_eq!(out.matches("9.9.9.9:8080").count(), 2);
    }

    #[tokio::test]
    async fn test_collect_conf_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.conf"), "x").unwrap();
        std::fs::write(dir.path().join("b.CONF"), "x").unwrap();
        std::fs::write(dir.path().join("c.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/d.conf"), "x").unwrap();

        let files = collect_conf_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 3);
    }
}
