use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use mesh_core::config::ServiceOverride;
use mesh_core::{LoadBalanceConfig, LoadBalanceStrategy};
use tracing::{debug, info};

use crate::Result;
use crate::discovery::{DiscoverySource, Instance};
use crate::error::CallError;
use crate::filter::FilterChain;
use crate::invocation::{Invocation, RoutingKey};
use crate::isolation::IsolationRegistry;
use crate::load_balance::{LoadBalancer, RuleContext, RuleFactory, Server};
use crate::outcome::{self, OutcomeClass};
use crate::retry::{RetryContext, RetryCoordinator};
use crate::stats::LoadBalancerStats;

type BalancerKey = (String, RoutingKey);

/// Entry point of the routing layer.
///
/// Keeps one [`LoadBalancer`] per (service, routing key). A change of the
/// strategy of any service, or a new configuration, throws all of them away
/// since rule state does not carry over between strategies. A balancer that
/// was built from a configuration replaced while it was being built is
/// dropped and built again.
pub struct LoadBalanceRouter {
    config: ArcSwap<LoadBalanceConfig>,
    discovery: Arc<dyn DiscoverySource>,
    stats: Arc<LoadBalancerStats>,
    isolation: Arc<IsolationRegistry>,
    rules: RuleFactory,
    coordinator: RetryCoordinator,

    balancers: DashMap<BalancerKey, Arc<LoadBalancer>>,
    /// strategy each service's balancers were built with
    strategies: DashMap<String, LoadBalanceStrategy>,
    invalidation: Mutex<()>,
}

impl LoadBalanceRouter {
    pub fn new(config: LoadBalanceConfig, discovery: Arc<dyn DiscoverySource>) -> Self {
        Self {
            stats: Arc::new(LoadBalancerStats::new(&config.stats)),
            isolation: Arc::new(IsolationRegistry::new(config.isolation.clone())),
            config: ArcSwap::from_pointee(config),
            discovery,
            rules: RuleFactory::new(),
            coordinator: RetryCoordinator::default(),

            balancers: DashMap::new(),
            strategies: DashMap::new(),
            invalidation: Mutex::new(()),
        }
    }

    /// Makes custom strategies available by name.
    pub fn with_rule_factory(mut self, rules: RuleFactory) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_retry_coordinator(mut self, coordinator: RetryCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn config(&self) -> Arc<LoadBalanceConfig> {
        self.config.load_full()
    }

    pub fn stats(&self) -> &Arc<LoadBalancerStats> {
        &self.stats
    }

    pub fn isolation(&self) -> &Arc<IsolationRegistry> {
        &self.isolation
    }

    pub fn balancer_count(&self) -> usize {
        self.balancers.len()
    }

    /// Swaps in a new configuration.
    ///
    /// Strategy changes are picked up lazily per service. Any other change
    /// drops the cached load balancers right away.
    pub fn update_config(&self, config: LoadBalanceConfig) {
        let _guard = self.invalidation.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.config.swap(Arc::new(config));
        if without_strategies(&previous) != without_strategies(&self.config.load()) {
            self.balancers.clear();
            self.strategies.clear();
            info!("Load balance config updated, cleared cached load balancers");
        }
    }

    fn invalidate_on_strategy_change(&self, service: &str, strategy: &LoadBalanceStrategy) {
        if self.strategies.get(service).is_some_and(|s| *s == *strategy) {
            return;
        }

        let _guard = self.invalidation.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.strategies.insert(service.to_string(), strategy.clone());
        match previous {
            Some(previous) if previous != *strategy => {
                self.balancers.clear();
                info!(
                    "Strategy of {} changed from {} to {}, cleared cached load balancers",
                    service, previous, strategy
                );
            }
            _ => {}
        }
    }

    pub fn load_balancer(&self, invocation: &Invocation) -> Result<Arc<LoadBalancer>> {
        loop {
            let config = self.config.load_full();
            let service = invocation.service();
            let strategy = config.strategy_for(service);
            self.invalidate_on_strategy_change(service, &strategy);

            let key = (service.to_string(), invocation.routing_key(config.granularity));
            let cached = self.balancers.get(&key).map(|lb| lb.value().clone());
            let lb = match cached {
                Some(lb) => lb,
                None => self
                    .balancers
                    .entry(key.clone())
                    .or_try_insert_with(|| self.build(&config, service, invocation, &strategy))?
                    .value()
                    .clone(),
            };

            if Arc::ptr_eq(&config, &*self.config.load()) {
                return Ok(lb);
            }
            // built from a configuration that was replaced meanwhile
            self.balancers.remove_if(&key, |_, cached| Arc::ptr_eq(cached, &lb));
        }
    }

    fn build(
        &self,
        config: &LoadBalanceConfig,
        service: &str,
        invocation: &Invocation,
        strategy: &LoadBalanceStrategy,
    ) -> Result<Arc<LoadBalancer>> {
        let ctx = RuleContext {
            service,
            config,
            stats: self.stats.clone(),
        };
        let rule = self.rules.create(strategy, &ctx)?;
        let filters = FilterChain::from_config(config, service, self.stats.clone(), self.isolation.clone());
        let key = invocation.routing_key(config.granularity);
        debug!(
            "Created load balancer for {} ({}) with rule {} and filters {:?}",
            service,
            key,
            rule.name(),
            filters.names()
        );
        Ok(Arc::new(LoadBalancer::new(
            service,
            key,
            rule,
            filters,
            self.stats.clone(),
            self.discovery.clone(),
        )))
    }

    fn prepare(&self, invocation: &Invocation) {
        if invocation.has_retry_context() {
            return;
        }
        let retry = self.config.load().retry_for(invocation.service());
        if retry.enabled {
            invocation.set_retry_context(RetryContext::new(&retry));
        }
    }

    /// Picks the server of the next attempt and stores it in the invocation.
    ///
    /// A caller supplied endpoint wins, it is neither balanced, accounted
    /// nor retried.
    pub fn choose_server(&self, invocation: &Invocation) -> Result<Server> {
        if let Some(endpoint) = invocation.supplied_endpoint() {
            let instance = Arc::new(Instance::new(endpoint.clone()).with_endpoint(endpoint.clone()));
            let server = Server::parse(&endpoint, instance)?;
            debug!("Using supplied endpoint {} for {}", endpoint, invocation.service());
            invocation.set_server(server.clone());
            return Ok(server);
        }

        self.prepare(invocation);
        let lb = self.load_balancer(invocation)?;
        let server = self.coordinator.choose(invocation, &lb)?;
        invocation.set_server(server.clone());
        Ok(server)
    }

    /// Folds a finished attempt into the stats of `server`.
    pub fn record_outcome(
        &self,
        server: &Server,
        result: std::result::Result<(), &CallError>,
        elapsed: Duration,
    ) -> OutcomeClass {
        outcome::record(&self.stats.stats_for(server), result, elapsed)
    }

    /// Isolation signal from an outer policy layer.
    pub fn isolate(&self, instance_id: &str, wait: Duration) {
        self.isolation.isolate(instance_id, wait);
    }

    pub fn recover(&self, instance_id: &str) -> bool {
        self.isolation.recover(instance_id)
    }
}

fn without_strategies(config: &LoadBalanceConfig) -> LoadBalanceConfig {
    let mut config = config.clone();
    config.strategy = LoadBalanceStrategy::default();
    for service in config.services.values_mut() {
        service.strategy = None;
    }
    config.services.retain(|_, service| *service != ServiceOverride::default());
    config
}
