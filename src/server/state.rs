//! Server state shared across handlers.

use std::sync::Arc;

use crate::context::AgentContext;
use crate::server::allowlist::IpAllowlist;

#[derive(Clone)]
pub struct ServerState {
    pub ctx: Arc<AgentContext>,
    pub allowlist: Arc<IpAllowlist>,
}

impl ServerState {
    pub fn new(ctx: Arc<AgentContext>, allowlist: Arc<IpAllowlist>) -> Self {
        Self { ctx, allowlist }
    }
}
