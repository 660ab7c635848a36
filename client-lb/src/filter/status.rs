use super::ServerListFilter;
use crate::invocation::Invocation;
use crate::load_balance::Server;

/// Drops servers whose instance is not up.
pub struct InstanceStatusFilter {
    enabled: bool,
}

impl InstanceStatusFilter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl ServerListFilter for InstanceStatusFilter {
    fn name(&self) -> &str {
        "InstanceStatus"
    }

    fn order(&self) -> i32 {
        100
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn filter(&self, servers: Vec<Server>, _invocation: &Invocation) -> Vec<Server> {
        servers.into_iter().filter(|s| s.is_ready_to_serve()).collect()
    }
}
