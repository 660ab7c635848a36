mod isolation;
mod status;
mod zone_aware;

pub use isolation::{IsolationFilter, StatsIsolationFilter};
pub use status::InstanceStatusFilter;
pub use zone_aware::ZoneAwareFilter;

use std::sync::Arc;

use mesh_core::LoadBalanceConfig;

use crate::invocation::Invocation;
use crate::isolation::IsolationRegistry;
use crate::load_balance::Server;
use crate::stats::LoadBalancerStats;

/// One step of the candidate list pipeline run before the rule.
pub trait ServerListFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn order(&self) -> i32;

    fn enabled(&self) -> bool {
        true
    }

    fn filter(&self, servers: Vec<Server>, invocation: &Invocation) -> Vec<Server>;
}

/// Enabled filters, sorted once by order.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn ServerListFilter>>,
}

impl FilterChain {
    pub fn new(mut filters: Vec<Arc<dyn ServerListFilter>>) -> Self {
        filters.retain(|f| f.enabled());
        filters.sort_by_key(|f| f.order());
        Self { filters }
    }

    /// The filters wired from configuration for `service`.
    pub fn from_config(
        config: &LoadBalanceConfig,
        service: &str,
        stats: Arc<LoadBalancerStats>,
        registry: Arc<IsolationRegistry>,
    ) -> Self {
        let filter = &config.filter;
        let isolation = config.isolation_for(service);
        let filters: Vec<Arc<dyn ServerListFilter>> = vec![
            Arc::new(InstanceStatusFilter::new(filter.status_enabled)),
            Arc::new(ZoneAwareFilter::new(
                filter.zone_aware_enabled,
                config.data_center.clone(),
                filter.zone_aware_ratio,
            )),
            Arc::new(StatsIsolationFilter::new(isolation, stats)),
            Arc::new(IsolationFilter::new(filter.isolation_enabled, registry)),
        ];
        Self::new(filters)
    }

    pub fn apply(&self, servers: Vec<Server>, invocation: &Invocation) -> Vec<Server> {
        self.filters
            .iter()
            .fold(servers, |servers, f| f.filter(servers, invocation))
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balance::test_servers;

    struct DropFirst(i32, bool);

    impl ServerListFilter for DropFirst {
        fn name(&self) -> &str {
            if self.0 == 1 { "one" } else { "two" }
        }

        fn order(&self) -> i32 {
            self.0
        }

        fn enabled(&self) -> bool {
            self.1
        }

        fn filter(&self, mut servers: Vec<Server>, _: &Invocation) -> Vec<Server> {
            if !servers.is_empty() {
                servers.remove(0);
            }
            servers
        }
    }

    #[test]
    fn test_chain_order_and_enabled() {
        let chain = FilterChain::new(vec![
            Arc::new(DropFirst(2, true)),
            Arc::new(DropFirst(1, true)),
            Arc::new(DropFirst(3, false)),
        ]);
        assert_eq!(chain.names(), vec!["one", "two"]);

        let out = chain.apply(test_servers(&["a", "b", "c"]), &Invocation::new("svc"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].instance_id(), "c");
    }

    #[test]
    fn test_default_chain() {
        let chain = FilterChain::from_config(
            &LoadBalanceConfig::default(),
            "svc",
            Arc::new(LoadBalancerStats::default()),
            Arc::new(IsolationRegistry::default()),
        );
        // no local data center configured, the zone filter switches itself off
        assert_eq!(chain.names(), vec!["InstanceStatus", "StatsIsolation", "Isolation"]);
    }
}
