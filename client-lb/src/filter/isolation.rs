use std::sync::Arc;

use mesh_core::config::IsolationConfig;
use tracing::{debug, warn};

use super::ServerListFilter;
use crate::invocation::Invocation;
use crate::isolation::IsolationRegistry;
use crate::load_balance::Server;
use crate::stats::{LoadBalancerStats, ServerHealthStats, ServerStatsSnapshot};

/// Removes servers that sit in the isolation registry.
pub struct IsolationFilter {
    enabled: bool,
    registry: Arc<IsolationRegistry>,
}

impl IsolationFilter {
    pub fn new(enabled: bool, registry: Arc<IsolationRegistry>) -> Self {
        Self { enabled, registry }
    }
}

impl ServerListFilter for IsolationFilter {
    fn name(&self) -> &str {
        "Isolation"
    }

    fn order(&self) -> i32 {
        500
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn filter(&self, servers: Vec<Server>, _invocation: &Invocation) -> Vec<Server> {
        self.registry.filter(servers)
    }
}

/// Isolates servers from their own call statistics.
///
/// The isolation lives on the server's stats, apart from the registry that
/// external signals write to. An isolated server is offered a single trial
/// call once `single_test_time` passed since its last visit. It is only
/// marked healthy once the thresholds clear and `min_isolation_time` passed.
pub struct StatsIsolationFilter {
    config: IsolationConfig,
    stats: Arc<LoadBalancerStats>,
}

impl StatsIsolationFilter {
    pub fn new(config: IsolationConfig, stats: Arc<LoadBalancerStats>) -> Self {
        Self { config, stats }
    }

    fn threshold_allowed(&self, snapshot: &ServerStatsSnapshot) -> bool {
        if snapshot.total_requests < self.config.enable_request_threshold {
            return true;
        }

        // the streak wins over the rate
        let streak = self.config.continuous_failure_threshold;
        if streak > 0 && snapshot.continuous_failures >= streak {
            return false;
        }

        let percentage = self.config.error_threshold_percentage;
        percentage == 0 || snapshot.failed_rate() < percentage as u64
    }

    fn allow_visit(&self, server: &Server, stats: &ServerHealthStats, invocation: &Invocation) -> bool {
        let now_ms = stats.now_ms();
        let snapshot = stats.snapshot_at(now_ms);

        if !self.threshold_allowed(&snapshot) {
            if !snapshot.isolated {
                warn!(
                    "Isolate service {}'s instance {}: {} continuous failures, {}% failed",
                    invocation.service(),
                    server.instance_id(),
                    snapshot.continuous_failures,
                    snapshot.failed_rate()
                );
                stats.mark_isolated_at(true, now_ms);
                return false;
            }

            let single_test_ms = self.config.single_test_time_ms;
            if now_ms.saturating_sub(snapshot.last_visit_ms) > single_test_ms
                && stats.try_begin_trial_at(now_ms, single_test_ms)
            {
                debug!(
                    "Trying isolated instance {} of {}",
                    server.instance_id(),
                    invocation.service()
                );
                return true;
            }
            return false;
        }

        if snapshot.isolated {
            if now_ms.saturating_sub(stats.isolated_at_ms()) <= self.config.min_isolation_time_ms {
                return false;
            }
            stats.mark_isolated_at(false, now_ms);
            warn!(
                "Recover service {}'s instance {} from isolation",
                invocation.service(),
                server.instance_id()
            );
        }
        true
    }
}

impl ServerListFilter for StatsIsolationFilter {
    fn name(&self) -> &str {
        "StatsIsolation"
    }

    fn order(&self) -> i32 {
        400
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn filter(&self, servers: Vec<Server>, invocation: &Invocation) -> Vec<Server> {
        servers
            .into_iter()
            .filter(|server| {
                let stats = self.stats.stats_for(server);
                self.allow_visit(server, &stats, invocation)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::load_balance::test_servers;

    struct Fixture {
        stats: Arc<LoadBalancerStats>,
        filter: StatsIsolationFilter,
    }

    fn fixture(config: IsolationConfig) -> Fixture {
        let stats = Arc::new(LoadBalancerStats::default());
        let filter = StatsIsolationFilter::new(config, stats.clone());
        Fixture { stats, filter }
    }

    fn run(f: &Fixture, servers: &[Server]) -> Vec<String> {
        f.filter
            .filter(servers.to_vec(), &Invocation::new("svc"))
            .iter()
            .map(|s| s.instance_id().to_string())
            .collect()
    }

    #[test]
    fn test_below_request_threshold() {
        let f = fixture(IsolationConfig::default());
        let servers = test_servers(&["a", "b"]);
        for _ in 0..4 {
            f.stats.record_failure(&servers[0]);
        }
        assert_eq!(run(&f, &servers), vec!["a", "b"]);
        assert!(!f.stats.snapshot(&servers[0]).isolated);
    }

    #[test]
    fn test_continuous_failures_isolate() {
        let f = fixture(IsolationConfig::default());
        let servers = test_servers(&["a", "b"]);
        for _ in 0..5 {
            f.stats.record_failure(&servers[0]);
        }
        assert_eq!(run(&f, &servers), vec!["b"]);
        assert!(f.stats.snapshot(&servers[0]).isolated);
    }

    #[test]
    fn test_error_rate_isolates() {
        let f = fixture(IsolationConfig {
            continuous_failure_threshold: 0,
            error_threshold_percentage: 50,
            ..Default::default()
        });
        let servers = test_servers(&["a", "b"]);
        for _ in 0..3 {
            f.stats.record_failure(&servers[0]);
            f.stats.record_success(&servers[0]);
        }
        assert_eq!(run(&f, &servers), vec!["b"]);
    }

    #[test]
    fn test_single_trial_after_test_time() {
        let f = fixture(IsolationConfig {
            single_test_time_ms: 30,
            ..Default::default()
        });
        let servers = test_servers(&["a", "b"]);
        for _ in 0..5 {
            f.stats.record_failure(&servers[0]);
        }
        assert_eq!(run(&f, &servers), vec!["b"]);

        std::thread::sleep(Duration::from_millis(50));
        // one caller gets the trial, nobody else while it is out
        assert_eq!(run(&f, &servers), vec!["a", "b"]);
        for _ in 0..20 {
            assert_eq!(run(&f, &servers), vec!["b"]);
        }

        // the trial fails, the next one waits for another test time
        f.stats.record_failure(&servers[0]);
        assert_eq!(run(&f, &servers), vec!["b"]);
        assert!(f.stats.snapshot(&servers[0]).isolated);
    }

    #[test]
    fn test_concurrent_callers_share_one_trial() {
        let f = Arc::new(fixture(IsolationConfig {
            single_test_time_ms: 30,
            ..Default::default()
        }));
        let servers = test_servers(&["a", "b"]);
        for _ in 0..5 {
            f.stats.record_failure(&servers[0]);
        }
        run(&f, &servers);
        std::thread::sleep(Duration::from_millis(50));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                let servers = servers.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| run(&f, &servers).contains(&"a".to_string()))
                        .count()
                })
            })
            .collect();
        let trials: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(trials, 1);
    }

    #[test]
    fn test_recovery_waits_for_min_isolation_time() {
        let f = fixture(IsolationConfig {
            single_test_time_ms: 30,
            min_isolation_time_ms: 100,
            ..Default::default()
        });
        let servers = test_servers(&["a", "b"]);
        for _ in 0..5 {
            f.stats.record_failure(&servers[0]);
        }
        run(&f, &servers);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(run(&f, &servers), vec!["a", "b"]);

        // the trial succeeds, yet the server stays out for the minimal time
        f.stats.record_success(&servers[0]);
        assert_eq!(run(&f, &servers), vec!["b"]);
        assert!(f.stats.snapshot(&servers[0]).isolated);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(run(&f, &servers), vec!["a", "b"]);
        assert!(!f.stats.snapshot(&servers[0]).isolated);
    }

    #[test]
    fn test_recovery_leaves_external_isolation_alone() {
        let f = fixture(IsolationConfig {
            min_isolation_time_ms: 0,
            ..Default::default()
        });
        let registry = IsolationRegistry::default();
        let servers = test_servers(&["a", "b"]);
        registry.isolate("a", Duration::from_secs(3600));
        for _ in 0..5 {
            f.stats.record_failure(&servers[0]);
        }
        assert_eq!(run(&f, &servers), vec!["b"]);

        f.stats.record_success(&servers[0]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(run(&f, &servers), vec!["a", "b"]);
        assert!(!f.stats.snapshot(&servers[0]).isolated);

        let kept = registry.filter(servers);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].instance_id(), "b");
    }
}
