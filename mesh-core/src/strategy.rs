use std::fmt;

use serde::{Deserialize, Serialize};

/// Server selection strategy, configured per microservice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    /// Prefer servers with lower recent average latency
    WeightedResponse,
    /// Pin calls to one server until a timeout or failure threshold is hit
    SessionStickiness,
    /// A rule registered by name with the rule factory
    #[serde(untagged)]
    Custom(String),
}

impl LoadBalanceStrategy {
    pub fn name(&self) -> &str {
        match self {
            LoadBalanceStrategy::RoundRobin => "RoundRobin",
            LoadBalanceStrategy::Random => "Random",
            LoadBalanceStrategy::WeightedResponse => "WeightedResponse",
            LoadBalanceStrategy::SessionStickiness => "SessionStickiness",
            LoadBalanceStrategy::Custom(name) => name,
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Granularity at which load balancers (and their rule state) are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
pub enum RoutingGranularity {
    /// One load balancer for the whole microservice
    #[default]
    Service,
    /// One load balancer per (schema, operation)
    Operation,
}
