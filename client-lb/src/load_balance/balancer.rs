use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, warn};

use super::{Rule, Server};
use crate::Result;
use crate::discovery::DiscoverySource;
use crate::error::LbError;
use crate::filter::FilterChain;
use crate::invocation::{Invocation, RoutingKey};
use crate::stats::LoadBalancerStats;

/// Servers built from one snapshot version.
struct Materialized {
    version: u64,
    transport: Option<String>,
    servers: Arc<Vec<Server>>,
}

/// Picks servers for one (service, routing key).
///
/// Owns the rule state, so it is never shared between routing keys.
pub struct LoadBalancer {
    service: String,
    key: RoutingKey,
    rule: Arc<dyn Rule>,
    filters: FilterChain,
    stats: Arc<LoadBalancerStats>,
    discovery: Arc<dyn DiscoverySource>,
    servers: ArcSwapOption<Materialized>,
}

impl LoadBalancer {
    pub fn new(
        service: impl Into<String>,
        key: RoutingKey,
        rule: Arc<dyn Rule>,
        filters: FilterChain,
        stats: Arc<LoadBalancerStats>,
        discovery: Arc<dyn DiscoverySource>,
    ) -> Self {
        Self {
            service: service.into(),
            key,
            rule,
            filters,
            stats,
            discovery,
            servers: ArcSwapOption::empty(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn rule_name(&self) -> &str {
        self.rule.name()
    }

    pub fn stats(&self) -> &Arc<LoadBalancerStats> {
        &self.stats
    }

    /// Servers of the latest snapshot, rebuilt only when its version moves.
    pub fn all_servers(&self, transport: Option<&str>) -> Arc<Vec<Server>> {
        let Some(snapshot) = self.discovery.snapshot(&self.service, &self.key) else {
            return Arc::new(Vec::new());
        };

        if let Some(cached) = self.servers.load_full()
            && cached.version == snapshot.version
            && cached.transport.as_deref() == transport
        {
            return cached.servers.clone();
        }

        let servers = Arc::new(snapshot.servers(transport));
        debug!(
            "Materialized {} servers of {} from snapshot version {}",
            servers.len(),
            self.service,
            snapshot.version
        );
        self.servers.store(Some(Arc::new(Materialized {
            version: snapshot.version,
            transport: transport.map(str::to_string),
            servers: servers.clone(),
        })));
        servers
    }

    pub fn choose_server(&self, invocation: &Invocation) -> Result<Server> {
        let all = self.all_servers(invocation.transport());
        let filtered = self.filters.apply(all.as_ref().clone(), invocation);
        let candidates: &[Server] = if filtered.is_empty() && !all.is_empty() {
            warn!(
                "Filters removed every server of {} ({}), falling back to all {} servers",
                self.service,
                self.key,
                all.len()
            );
            all.as_slice()
        } else {
            filtered.as_slice()
        };

        let server = self
            .rule
            .choose(candidates, invocation)
            .ok_or_else(|| LbError::NoServerAvailable {
                service: self.service.clone(),
            })?;
        debug!("{} chose {} for {}", self.rule.name(), server, self.service);
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Instance, StaticDiscovery};
    use crate::filter::ServerListFilter;
    use crate::load_balance::RoundRobinRule;

    struct DropAll;

    impl ServerListFilter for DropAll {
        fn name(&self) -> &str {
            "DropAll"
        }

        fn order(&self) -> i32 {
            0
        }

        fn filter(&self, _: Vec<Server>, _: &Invocation) -> Vec<Server> {
            Vec::new()
        }
    }

    fn balancer(discovery: Arc<StaticDiscovery>, filters: FilterChain) -> LoadBalancer {
        LoadBalancer::new(
            "orders",
            RoutingKey::Service,
            Arc::new(RoundRobinRule::new()),
            filters,
            Arc::new(LoadBalancerStats::default()),
            discovery,
        )
    }

    fn instances(ids: &[&str]) -> Vec<Instance> {
        ids.iter()
            .map(|id| Instance::new(*id).with_endpoint(format!("rest://{}:8080", id)))
            .collect()
    }

    #[test]
    fn test_no_server_available() {
        let discovery = Arc::new(StaticDiscovery::new());
        let lb = balancer(discovery.clone(), FilterChain::default());
        let err = lb.choose_server(&Invocation::new("orders")).unwrap_err();
        assert!(matches!(err, LbError::NoServerAvailable { ref service } if service == "orders"));

        discovery.update("orders", Vec::new());
        assert!(lb.choose_server(&Invocation::new("orders")).is_err());
    }

    #[test]
    fn test_filters_fail_open() {
        let discovery = Arc::new(StaticDiscovery::new());
        discovery.update("orders", instances(&["a", "b"]));
        let lb = balancer(discovery, FilterChain::new(vec![Arc::new(DropAll)]));
        let server = lb.choose_server(&Invocation::new("orders")).unwrap();
        assert!(["a", "b"].contains(&server.instance_id()));
    }

    #[test]
    fn test_follows_snapshot_versions() {
        let discovery = Arc::new(StaticDiscovery::new());
        discovery.update("orders", instances(&["a"]));
        let lb = balancer(discovery.clone(), FilterChain::default());

        let first = lb.all_servers(None);
        assert!(Arc::ptr_eq(&first, &lb.all_servers(None)));
        assert_eq!(lb.choose_server(&Invocation::new("orders")).unwrap().instance_id(), "a");

        discovery.update("orders", instances(&["b"]));
        assert_eq!(lb.choose_server(&Invocation::new("orders")).unwrap().instance_id(), "b");
    }

    #[test]
    fn test_transport_selection() {
        let discovery = Arc::new(StaticDiscovery::new());
        discovery.update(
            "orders",
            vec![
                Instance::new("a").with_endpoint("highway://a:7070"),
                Instance::new("b").with_endpoint("rest://b:8080"),
            ],
        );
        let lb = balancer(discovery, FilterChain::default());
        let inv = Invocation::new("orders").with_transport("rest");
        for _ in 0..4 {
            assert_eq!(lb.choose_server(&inv).unwrap().instance_id(), "b");
        }
    }
}
