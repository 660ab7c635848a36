mod ewma;
mod server_stats;

pub use ewma::Ewma;
pub use server_stats::{ServerHealthStats, ServerStatsSnapshot};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mesh_core::config::StatsConfig;
use serde::Serialize;
use tracing::debug;

use crate::load_balance::Server;
use crate::ttl::TtlMap;

/// Every this many lookups the idle entries are swept.
const SWEEP_EVERY: u64 = 1024;

/// Health stats of every server this process talked to, keyed by instance id.
///
/// Entries are created on first reference and dropped once nobody looked at
/// them for the idle expiry.
pub struct LoadBalancerStats {
    servers: TtlMap<String, Arc<ServerHealthStats>>,
    window: Duration,
    idle_expiry: Duration,
    lookups: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatsExport {
    #[serde(flatten)]
    pub stats: ServerStatsSnapshot,
    pub success_rate: u64,
    pub failed_rate: u64,
    pub average_latency_ms: Option<f64>,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsExport {
    pub servers: BTreeMap<String, ServerStatsExport>,
}

impl StatsExport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Default for LoadBalancerStats {
    fn default() -> Self {
        Self::new(&StatsConfig::default())
    }
}

impl LoadBalancerStats {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            servers: TtlMap::new(),
            window: config.window(),
            idle_expiry: config.idle_expiry(),
            lookups: AtomicU64::new(0),
        }
    }

    pub fn stats_for(&self, server: &Server) -> Arc<ServerHealthStats> {
        self.stats_for_id(server.instance_id())
    }

    pub fn stats_for_id(&self, instance_id: &str) -> Arc<ServerHealthStats> {
        if self.lookups.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.evict_idle();
        }
        let window = self.window;
        self.servers
            .get_or_insert_with(instance_id.to_string(), self.idle_expiry, || {
                Arc::new(ServerHealthStats::new(window))
            })
    }

    pub fn record_success(&self, server: &Server) {
        self.stats_for(server).mark_success();
    }

    pub fn record_failure(&self, server: &Server) {
        self.stats_for(server).mark_failure();
    }

    pub fn snapshot(&self, server: &Server) -> ServerStatsSnapshot {
        self.stats_for(server).snapshot()
    }

    pub fn note_response_time(&self, server: &Server, elapsed: Duration) {
        self.stats_for(server).note_response_time(elapsed);
    }

    pub fn average_latency_ms(&self, server: &Server) -> Option<f64> {
        self.stats_for(server).average_latency_ms()
    }

    pub fn continuous_failures(&self, server: &Server) -> u32 {
        self.stats_for(server).continuous_failures()
    }

    pub fn reset_continuous_failures(&self, server: &Server) {
        self.stats_for(server).reset_continuous_failures();
    }

    pub fn mark_isolated(&self, server: &Server, isolated: bool) {
        self.stats_for(server).mark_isolated(isolated);
    }

    pub fn export(&self) -> StatsExport {
        let servers = self
            .servers
            .entries()
            .into_iter()
            .map(|(id, stats)| {
                let snapshot = stats.snapshot();
                let export = ServerStatsExport {
                    success_rate: snapshot.success_rate(),
                    failed_rate: snapshot.failed_rate(),
                    stats: snapshot,
                    average_latency_ms: stats.average_latency_ms(),
                    in_flight: stats.in_flight(),
                };
                (id, export)
            })
            .collect();
        StatsExport { servers }
    }

    pub fn evict_idle(&self) -> usize {
        let evicted = self.servers.sweep();
        if evicted > 0 {
            debug!("Evicted {} idle server stats", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Instance;

    fn server(id: &str) -> Server {
        let instance = Arc::new(Instance::new(id).with_endpoint(format!("rest://127.0.0.1:{}", 8000 + id.len())));
        Server::from_instance(instance, None).unwrap()
    }

    #[test]
    fn test_stats_shared_per_instance() {
        let stats = LoadBalancerStats::default();
        let a = server("a");
        stats.record_failure(&a);
        stats.record_failure(&a);
        stats.record_failure(&a);
        assert_eq!(stats.snapshot(&a).continuous_failures, 3);

        stats.record_success(&a);
        assert_eq!(stats.snapshot(&a).continuous_failures, 0);
        assert_eq!(stats.snapshot(&a).total_requests, 4);
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn test_idle_entries_are_evicted() {
        let stats = LoadBalancerStats::new(&StatsConfig {
            window_ms: 60_000,
            idle_expiry_ms: 20,
        });
        stats.record_failure(&server("a"));
        assert_eq!(stats.len(), 1);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(stats.evict_idle(), 1);
        assert!(stats.is_empty());
        // a fresh record starts from zero
        assert_eq!(stats.snapshot(&server("a")).total_requests, 0);
    }

    #[test]
    fn test_export() {
        let stats = LoadBalancerStats::default();
        let a = server("a");
        stats.record_failure(&a);
        stats.record_success(&a);
        stats.note_response_time(&a, Duration::from_millis(8));

        let export = stats.export();
        let a_export = &export.servers["a"];
        assert_eq!(a_export.stats.total_requests, 2);
        assert_eq!(a_export.failed_rate, 50);
        assert_eq!(a_export.average_latency_ms, Some(8.0));

        let json = export.to_json().unwrap();
        assert!(json.contains("\"total_requests\":2"), "{}", json);
    }
}
