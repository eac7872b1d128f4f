//! cicd-agent entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};

use cicd_agent::config::Settings;
use cicd_agent::context::AgentContext;
use cicd_agent::logs::init_logging;
use cicd_agent::server::allowlist::IpAllowlist;
use cicd_agent::server::serve::serve;
use cicd_agent::server::state::ServerState;
use cicd_agent::tasks::retention::start_retention_worker;

const DEFAULT_CONFIG_PATH: &str = "config/settings.json";

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .skip(1)
        .find_map(|arg| {
            arg.strip_prefix("--config=")
                .map(str::to_string)
                .or_else(|| arg.strip_prefix("-c=").map(str::to_string))
        })
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let settings = match Settings::load(&config_path).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load settings from {}: {}", config_path, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&settings.log_level) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }
    info!("settings loaded from {}", config_path);

    let allowlist = match IpAllowlist::init(&settings).await {
        Ok(list) => list,
        Err(e) => {
            error!("failed to initialize allow-list: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let addr = settings.server_addr();
    let retention_days = settings.log_retention_days;
    let ctx = AgentContext::new(settings);

    allowlist.start_refresh_worker(ctx.settings.clone());
    start_retention_worker(PathBuf::from("logs"), retention_days);

    let state = ServerState::new(ctx, allowlist);
    info!("starting cicd-agent on {}", addr);
    if let Err(e) = serve(&addr, state, await_shutdown_signal()).await {
        error!("server exited with error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("clean shutdown");
    ExitCode::SUCCESS
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
        info!("ctrl-c received, shutting down...");
    }
}
