//! Intake IP allow-list.
//!
//! Configured entries are literal IPv4 addresses or hostnames; hostnames are
//! re-resolved on a configured interval so DNS changes propagate without a
//! restart. Rejected callers get a 404 rather than a 403 to keep the service
//! surface quiet.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{info, warn};

use crate::config::Settings;
use crate::errors::AgentError;

/// Snapshot of allowed source IPs.
pub struct IpAllowlist {
    allowed: RwLock<HashSet<String>>,
}

impl IpAllowlist {
    /// Resolve the configured entries once. Fails when entries are
    /// configured but none resolve: an intake with an empty allow-list
    /// would reject every caller.
    pub async fn init(settings: &Settings) -> Result<Arc<Self>, AgentError> {
        let list = Arc::new(Self {
            allowed: RwLock::new(HashSet::new()),
        });
        list.refresh(settings).await;

        if !settings.allowlist.domains.is_empty() && list.allowed.read().unwrap().is_empty() {
            return Err(AgentError::ConfigError(
                "allow-list configured but no entries resolved".to_string(),
            ));
        }
        Ok(list)
    }

    /// Re-resolve all entries, replacing the snapshot.
    pub async fn refresh(&self, settings: &Settings) {
        let mut resolved = HashSet::new();
        for entry in &settings.allowlist.domains {
            if entry.parse::<IpAddr>().is_ok() {
                resolved.insert(entry.clone());
                continue;
            }

            match tokio::net::lookup_host(format!("{}:0", entry)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if let IpAddr::V4(v4) = addr.ip() {
                            resolved.insert(v4.to_string());
                        }
                    }
                }
                Err(e) => warn!("failed to resolve allow-list entry {}: {}", entry, e),
            }
        }

        let mut allowed = self.allowed.write().unwrap();
        *allowed = resolved;
        info!("allow-list refreshed: {} addresses", allowed.len());
    }

    pub fn is_allowed(&self, ip: &str) -> bool {
        self.allowed.read().unwrap().contains(ip)
    }

    /// Spawn the periodic refresh worker.
    pub fn start_refresh_worker(self: &Arc<Self>, settings: Arc<Settings>) {
        let list = self.clone();
        tokio::spawn(async move {
            let interval = settings.allowlist_interval();
            loop {
                tokio::time::sleep(interval).await;
                list.refresh(&settings).await;
            }
        });
    }
}

/// Proxy-aware client address: `X-Forwarded-For` (first hop), then
/// `X-Real-IP`, then the peer address.
pub fn client_ip(request: &Request<Body>, peer: &SocketAddr) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
    {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.ip().to_string()
}

/// Middleware enforcing the allow-list on intake routes.
pub async fn allowlist_middleware(
    State(list): State<Arc<IpAllowlist>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request, &peer);
    if !list.is_allowed(&ip) {
        warn!("rejected intake request from {}", ip);
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"code": 404, "msg": "Not Found"})),
        )
            .into_response();
    }
    next.run(request).await
}
