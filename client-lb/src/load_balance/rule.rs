use std::collections::HashMap;
use std::sync::Arc;

use mesh_core::{LoadBalanceConfig, LoadBalanceStrategy};

use super::{RandomRule, RoundRobinRule, Server, SessionStickinessRule, WeightedResponseTimeRule};
use crate::Result;
use crate::error::LbError;
use crate::invocation::Invocation;
use crate::stats::LoadBalancerStats;

/// Picks one server out of the filtered candidates.
///
/// `None` only for an empty candidate list.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    fn choose(&self, candidates: &[Server], invocation: &Invocation) -> Option<Server>;
}

/// Everything a rule may need when it is built for one load balancer.
pub struct RuleContext<'a> {
    pub service: &'a str,
    pub config: &'a LoadBalanceConfig,
    pub stats: Arc<LoadBalancerStats>,
}

type RuleConstructor = Arc<dyn Fn(&RuleContext<'_>) -> Arc<dyn Rule> + Send + Sync>;

/// Resolves a configured strategy into a rule instance.
///
/// Built-in strategies are always available, anything else has to be
/// registered by name first.
#[derive(Default, Clone)]
pub struct RuleFactory {
    custom: HashMap<String, RuleConstructor>,
}

impl RuleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&RuleContext<'_>) -> Arc<dyn Rule> + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Arc::new(ctor));
    }

    pub fn create(&self, strategy: &LoadBalanceStrategy, ctx: &RuleContext<'_>) -> Result<Arc<dyn Rule>> {
        let rule: Arc<dyn Rule> = match strategy {
            LoadBalanceStrategy::RoundRobin => Arc::new(RoundRobinRule::new()),
            LoadBalanceStrategy::Random => Arc::new(RandomRule),
            LoadBalanceStrategy::WeightedResponse => Arc::new(WeightedResponseTimeRule::new(
                &ctx.config.weighted,
                ctx.stats.clone(),
            )),
            LoadBalanceStrategy::SessionStickiness => Arc::new(SessionStickinessRule::new(
                &ctx.config.sticky_for(ctx.service),
                ctx.stats.clone(),
            )),
            LoadBalanceStrategy::Custom(name) => {
                let ctor = self
                    .custom
                    .get(name)
                    .ok_or_else(|| LbError::UnknownStrategy(name.clone()))?;
                ctor(ctx)
            }
        };
        Ok(rule)
    }
}
