mod balancer;
mod endpoint;
mod random;
mod round_robin;
mod rule;
mod sticky;
mod weighted;

pub use balancer::LoadBalancer;
pub use endpoint::Server;
pub use random::RandomRule;
pub use round_robin::RoundRobinRule;
pub use rule::{Rule, RuleContext, RuleFactory};
pub use sticky::SessionStickinessRule;
pub use weighted::WeightedResponseTimeRule;

#[cfg(test)]
pub(crate) fn test_servers(ids: &[&str]) -> Vec<Server> {
    use std::sync::Arc;

    use crate::discovery::Instance;

    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let instance = Instance::new(*id).with_endpoint(format!("rest://10.0.0.{}:8080", i + 1));
            Server::from_instance(Arc::new(instance), None).expect("test endpoint")
        })
        .collect()
}
