//! Agent settings file management

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::logs::LogLevel;

/// Fallback envelope key used when the settings omit one. 32 bytes.
const DEFAULT_ENCRYPTION_SALT: &str = "DqJHGSTaw11yWhyjhMmiX1hgd3AoYARg";

/// Agent settings, loaded from a JSON file at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// HTTP server bind configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Upstream control-plane endpoints
    #[serde(default)]
    pub remote: RemoteSettings,

    /// Container registries
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Callback URL advertised to the upstream
    #[serde(default)]
    pub callback: CallbackSettings,

    /// Front-end bundle locations
    #[serde(default)]
    pub web: WebSettings,

    /// Intake IP allow-list
    #[serde(default)]
    pub allowlist: AllowlistSettings,

    /// Project classification
    #[serde(default)]
    pub projects: ProjectSettings,

    /// Project name -> base directory, per rollout family
    #[serde(default)]
    pub deployment: DeploymentSettings,

    /// Control-plane notification channel
    #[serde(default)]
    pub notification: NotificationSettings,

    /// Traffic proxy switching
    #[serde(default)]
    pub traffic_proxy: TrafficProxySettings,

    /// Nginx-mediated switching
    #[serde(default)]
    pub nginx: NginxSettings,

    /// Task log retention in days
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Upstream endpoint that /update requests are forwarded to
    #[serde(default)]
    pub update_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Source registry host (images are pulled from here)
    #[serde(default)]
    pub online: String,
    /// Destination registry host (images are retagged and pushed here)
    #[serde(default)]
    pub offline: String,
    #[serde(default)]
    pub offline_user: String,
    #[serde(default)]
    pub offline_password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackSettings {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSettings {
    /// Base URL the build service publishes bundles under
    #[serde(default)]
    pub download_url: String,
    /// Path segment between the base URL and the bundle name
    #[serde(default)]
    pub download_dir: String,
    /// Root directory served by the web tier, e.g. `/www/`
    #[serde(default = "default_web_dir")]
    pub web_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistSettings {
    /// Hostnames or literal IPv4 addresses allowed to reach the intake
    #[serde(default)]
    pub domains: Vec<String>,
    /// Refresh interval in seconds for re-resolving the domains
    #[serde(default = "default_allowlist_interval")]
    pub update_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Backend project names accepted by the intake
    #[serde(default)]
    pub valid_names: Vec<String>,
    /// Substring identifying front-end projects, e.g. `-web`
    #[serde(default = "default_web_keyword")]
    pub web_keyword: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentSettings {
    /// Blue/green projects: name -> base directory
    #[serde(default)]
    pub double: HashMap<String, String>,
    /// Single-replica projects: name -> base directory
    #[serde(default)]
    pub single: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub notify_url: String,
    /// 32-byte key for the notification envelope
    #[serde(default)]
    pub encryption_salt: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficProxySettings {
    #[serde(default)]
    pub enable: bool,
    /// Project name -> proxy endpoints whose /switch route flips traffic
    #[serde(default)]
    pub endpoints: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NginxSettings {
    /// Directory holding the .conf files rewritten during a switch
    #[serde(default = "default_nginx_conf_dir")]
    pub conf_dir: String,
    /// Hosts that get `nginx -s reload` over SSH after a rewrite
    #[serde(default)]
    pub reload_hosts: Vec<String>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_key_file")]
    pub ssh_key_file: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8089
}

fn default_web_dir() -> String {
    "/www/".to_string()
}

fn default_web_keyword() -> String {
    "-web".to_string()
}

fn default_allowlist_interval() -> u64 {
    300
}

fn default_nginx_conf_dir() -> String {
    "/etc/nginx/conf.d".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_key_file() -> String {
    "/root/.ssh/id_rsa".to_string()
}

fn default_log_retention_days() -> u32 {
    7
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            download_url: String::new(),
            download_dir: String::new(),
            web_dir: default_web_dir(),
        }
    }
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            valid_names: Vec::new(),
            web_keyword: default_web_keyword(),
        }
    }
}

impl Default for AllowlistSettings {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            update_interval_secs: default_allowlist_interval(),
        }
    }
}

impl Default for NginxSettings {
    fn default() -> Self {
        Self {
            conf_dir: default_nginx_conf_dir(),
            reload_hosts: Vec::new(),
            ssh_user: default_ssh_user(),
            ssh_key_file: default_ssh_key_file(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            server: ServerSettings::default(),
            remote: RemoteSettings::default(),
            registry: RegistrySettings::default(),
            callback: CallbackSettings::default(),
            web: WebSettings::default(),
            allowlist: AllowlistSettings::default(),
            projects: ProjectSettings::default(),
            deployment: DeploymentSettings::default(),
            notification: NotificationSettings::default(),
            traffic_proxy: TrafficProxySettings::default(),
            nginx: NginxSettings::default(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let contents = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| {
                AgentError::ConfigError(format!(
                    "unable to read settings file {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;
        let settings: Settings = serde_json::from_str(&contents)
            .map_err(|e| AgentError::ConfigError(format!("invalid settings file: {}", e)))?;
        Ok(settings)
    }

    /// Address the HTTP server binds to.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Full callback URL advertised to the upstream build service.
    pub fn callback_url(&self) -> String {
        format!("{}{}", self.callback.domain, self.callback.path)
    }

    /// Allow-list refresh interval.
    pub fn allowlist_interval(&self) -> Duration {
        Duration::from_secs(self.allowlist.update_interval_secs.max(1))
    }

    /// Key for the notification envelope. Must be 32 bytes.
    pub fn encryption_salt(&self) -> &str {
        if self.notification.encryption_salt.is_empty() {
            DEFAULT_ENCRYPTION_SALT
        } else {
            &self.notification.encryption_salt
        }
    }

    /// Notify URL, or `None` when notifications are disabled.
    pub fn notify_url(&self) -> Option<&str> {
        if self.notification.enable && !self.notification.notify_url.is_empty() {
            Some(&self.notification.notify_url)
        } else {
            None
        }
    }

    /// A project is valid when it is a configured backend name or carries
    /// the web keyword.
    pub fn is_valid_project(&self, project: &str) -> bool {
        self.projects.valid_names.iter().any(|p| p == project) || self.is_web_project(project)
    }

    pub fn is_web_project(&self, project: &str) -> bool {
        !self.projects.web_keyword.is_empty() && project.contains(&self.projects.web_keyword)
    }

    pub fn is_double_project(&self, project: &str) -> bool {
        self.deployment.double.contains_key(project)
    }

    pub fn is_single_project(&self, project: &str) -> bool {
        self.deployment.single.contains_key(project)
    }

    /// Base directory for a backend project, double projects first.
    pub fn project_base(&self, project: &str) -> Option<&str> {
        self.deployment
            .double
            .get(project)
            .or_else(|| self.deployment.single.get(project))
            .map(String::as_str)
    }

    /// Web directory for a front-end project: `ysh-web` -> `/www/ysh/web`.
    pub fn web_path(&self, project: &str) -> String {
        let stem = project
            .strip_suffix(&self.projects.web_keyword)
            .unwrap_or(project);
        format!("{}{}/web", self.web.web_dir, stem)
    }

    /// Traffic proxy endpoints configured for a project.
    pub fn proxy_endpoints(&self, project: &str) -> &[String] {
        self.traffic_proxy
            .endpoints
            .get(project)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_projects() -> Settings {
        let mut s = Settings::default();
        s.projects.valid_names = vec!["svc-a".to_string(), "bxhd-risk".to_string()];
        s.deployment
            .double
            .insert("svc-a".to_string(), "/data/project/svc-a".to_string());
        s.deployment
            .single
            .insert("bxhd-risk".to_string(), "/data/project/bxhd-risk".to_string());
        s
    }

    #[test]
    fn test_project_classification() {
        let s = settings_with_projects();
        assert!(s.is_valid_project("svc-a"));
        assert!(s.is_valid_project("ysh-web"));
        assert!(!s.is_valid_project("unknown"));
        assert!(s.is_double_project("svc-a"));
        assert!(!s.is_double_project("bxhd-risk"));
        assert!(s.is_single_project("bxhd-risk"));
        assert!(s.is_web_project("ysh-web"));
        assert!(!s.is_web_project("svc-a"));
    }

    #[test]
    fn test_project_base_prefers_double() {
        let mut s = settings_with_projects();
        s.deployment
            .single
            .insert("svc-a".to_string(), "/elsewhere".to_string());
        assert_eq!(s.project_base("svc-a"), Some("/data/project/svc-a"));
        assert_eq!(s.project_base("unknown"), None);
    }

    #[test]
    fn test_web_path_strips_keyword() {
        let s = Settings::default();
        assert_eq!(s.web_path("ysh-web"), "/www/ysh/web");
        assert_eq!(s.web_path("ysh-risk-web"), "/www/ysh-risk/web");
    }

    #[test]
    fn test_default_salt_is_32_bytes() {
        let s = Settings::default();
        assert_eq!(s.encryption_salt().len(), 32);
    }

    #[test]
    fn test_settings_parse_with_defaults() {
        let s: Settings = serde_json::from_str(r#"{"server":{"port":9000}}"#).unwrap();
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.log_retention_days, 7);
        assert_eq!(s.projects.web_keyword, "-web");
    }
}
