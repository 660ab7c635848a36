use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use mesh_core::config::DataCenter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::invocation::RoutingKey;
use crate::load_balance::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    OutOfService,
    Testing,
}

/// A running copy of a microservice as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    /// transport qualified, `scheme://host:port`
    pub endpoints: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub data_center: Option<DataCenter>,
    pub status: InstanceStatus,
}

impl Instance {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_data_center(mut self, data_center: DataCenter) -> Self {
        self.data_center = Some(data_center);
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }
}

/// The instance list of one service at one point in time.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    pub instances: Vec<Arc<Instance>>,
    pub version: u64,
}

impl DiscoverySnapshot {
    pub fn new(version: u64, instances: Vec<Instance>) -> Self {
        Self {
            instances: instances.into_iter().map(Arc::new).collect(),
            version,
        }
    }

    /// One server per instance that has a usable endpoint for `transport`.
    pub fn servers(&self, transport: Option<&str>) -> Vec<Server> {
        self.instances
            .iter()
            .filter_map(|instance| {
                let server = instance
                    .endpoints
                    .iter()
                    .filter_map(|endpoint| match Server::parse(endpoint, instance.clone()) {
                        Ok(server) => Some(server),
                        Err(e) => {
                            warn!("Skipping endpoint of instance {}: {}", instance.instance_id, e);
                            None
                        }
                    })
                    .find(|server| transport.is_none_or(|t| server.transport() == t));
                if server.is_none() {
                    debug!(
                        "Instance {} has no endpoint for transport {:?}",
                        instance.instance_id, transport
                    );
                }
                server
            })
            .collect()
    }
}

/// Supplies the latest instance snapshot, re-read on every call.
pub trait DiscoverySource: Send + Sync {
    fn snapshot(&self, service: &str, key: &RoutingKey) -> Option<Arc<DiscoverySnapshot>>;
}

/// In-memory discovery source fed by `update`.
#[derive(Default)]
pub struct StaticDiscovery {
    services: DashMap<String, Arc<DiscoverySnapshot>>,
    version: AtomicU64,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the instances of `service`, returns the new snapshot version.
    pub fn update(&self, service: impl Into<String>, instances: Vec<Instance>) -> u64 {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        self.services
            .insert(service.into(), Arc::new(DiscoverySnapshot::new(version, instances)));
        version
    }

    pub fn remove(&self, service: &str) {
        self.services.remove(service);
    }
}

impl DiscoverySource for StaticDiscovery {
    fn snapshot(&self, service: &str, _key: &RoutingKey) -> Option<Arc<DiscoverySnapshot>> {
        self.services.get(service).map(|s| s.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servers_follow_transport() {
        let snapshot = DiscoverySnapshot::new(
            1,
            vec![
                Instance::new("a")
                    .with_endpoint("rest://10.0.0.1:8080")
                    .with_endpoint("highway://10.0.0.1:7070"),
                Instance::new("b").with_endpoint("rest://10.0.0.2:8080"),
            ],
        );

        let all = snapshot.servers(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].transport(), "rest");

        let highway = snapshot.servers(Some("highway"));
        assert_eq!(highway.len(), 1);
        assert_eq!(highway[0].instance_id(), "a");
        assert_eq!(highway[0].authority().as_str(), "10.0.0.1:7070");
    }

    #[test]
    fn test_unparseable_endpoints_are_skipped() {
        let snapshot = DiscoverySnapshot::new(
            1,
            vec![
                Instance::new("a").with_endpoint("not an endpoint"),
                Instance::new("b")
                    .with_endpoint("::::")
                    .with_endpoint("rest://10.0.0.2:8080"),
            ],
        );
        let servers = snapshot.servers(None);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].instance_id(), "b");
    }

    #[test]
    fn test_static_discovery_versions() {
        let discovery = StaticDiscovery::new();
        assert!(discovery.snapshot("orders", &RoutingKey::Service).is_none());

        let v1 = discovery.update("orders", vec![Instance::new("a").with_endpoint("rest://h:1")]);
        let v2 = discovery.update("orders", vec![Instance::new("b").with_endpoint("rest://h:2")]);
        assert!(v2 > v1);

        let snapshot = discovery.snapshot("orders", &RoutingKey::Service).unwrap();
        assert_eq!(snapshot.version, v2);
        assert_eq!(snapshot.instances[0].instance_id, "b");
    }
}
