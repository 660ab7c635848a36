use mesh_core::config::DataCenter;
use tracing::debug;

use super::ServerListFilter;
use crate::invocation::Invocation;
use crate::load_balance::Server;

/// Prefers servers close to the local data center.
///
/// Servers are grouped as same zone, same region, then everything else.
/// Groups are taken in that order until they hold at least `ratio` percent
/// of all servers.
pub struct ZoneAwareFilter {
    enabled: bool,
    local: Option<DataCenter>,
    ratio: u32,
}

impl ZoneAwareFilter {
    pub fn new(enabled: bool, local: Option<DataCenter>, ratio: u32) -> Self {
        Self {
            enabled,
            local,
            ratio: ratio.min(100),
        }
    }

    fn group(local: &DataCenter, server: &Server) -> usize {
        match &server.instance().data_center {
            Some(dc) if dc.region == local.region && dc.zone == local.zone => 0,
            Some(dc) if dc.region == local.region => 1,
            _ => 2,
        }
    }
}

impl ServerListFilter for ZoneAwareFilter {
    fn name(&self) -> &str {
        "ZoneAware"
    }

    fn order(&self) -> i32 {
        300
    }

    fn enabled(&self) -> bool {
        self.enabled && self.local.is_some()
    }

    fn filter(&self, servers: Vec<Server>, _invocation: &Invocation) -> Vec<Server> {
        let Some(local) = &self.local else {
            return servers;
        };
        let total = servers.len();

        let mut groups: [Vec<Server>; 3] = Default::default();
        for server in servers {
            groups[Self::group(local, &server)].push(server);
        }

        let mut kept = Vec::with_capacity(total);
        for (level, group) in groups.into_iter().enumerate() {
            kept.extend(group);
            if !kept.is_empty() && kept.len() * 100 >= total * self.ratio as usize {
                debug!("Zone aware filter kept {} of {} servers at level {}", kept.len(), total, level);
                break;
            }
        }
        kept
    }
}
