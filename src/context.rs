//! Shared agent state handed to every orchestrator call.

use std::sync::Arc;

use crate::config::Settings;
use crate::notify::NotificationBus;
use crate::paths::Resolver;
use crate::tasks::registry::TaskRegistry;
use crate::version::VersionLedger;

/// Process-wide collaborators: configuration, the task registry, the version
/// ledger, the notification bus and the path resolver.
pub struct AgentContext {
    pub settings: Arc<Settings>,
    pub registry: Arc<TaskRegistry>,
    pub ledger: Arc<VersionLedger>,
    pub notifier: Arc<NotificationBus>,
    pub resolver: Arc<Resolver>,
    pub http_client: reqwest::Client,
}

impl AgentContext {
    pub fn new(settings: Settings) -> Arc<Self> {
        let settings = Arc::new(settings);
        let ledger = Arc::new(VersionLedger::new());
        let notifier = Arc::new(NotificationBus::new(settings.clone(), ledger.clone()));
        let resolver = Arc::new(Resolver::new(settings.clone(), ledger.clone()));
        Arc::new(Self {
            settings,
            registry: Arc::new(TaskRegistry::new()),
            ledger,
            notifier,
            resolver,
            http_client: reqwest::Client::new(),
        })
    }
}
