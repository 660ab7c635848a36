use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use mesh_core::config::WeightedConfig;
use rand::Rng;
use tracing::debug;

use super::{RoundRobinRule, Rule, Server};
use crate::invocation::Invocation;
use crate::stats::LoadBalancerStats;

/// Weights computed for a candidate list of `size` servers, by position.
struct WeightTable {
    size: usize,
    cumulative: Vec<f64>,
    total: f64,
    /// latencies are indistinguishable, plain rotation is enough
    uniform: bool,
}

impl WeightTable {
    fn build(latencies: &[f64], min_gap_ms: f64) -> Self {
        let size = latencies.len();
        let total_latency: f64 = latencies.iter().sum();
        let uniform = latencies.iter().all(|l| *l < min_gap_ms);

        let mut acc = 0.0;
        let cumulative: Vec<f64> = latencies
            .iter()
            .map(|l| {
                acc += total_latency - l;
                acc
            })
            .collect();

        Self {
            size,
            cumulative,
            total: acc,
            // a single server, or nothing to tell apart
            uniform: uniform || acc <= 0.0,
        }
    }

    fn draw(&self, r: f64) -> usize {
        self.cumulative
            .partition_point(|c| *c <= r)
            .min(self.size.saturating_sub(1))
    }
}

/// Prefers servers with a lower average response time.
///
/// The weight table is rebuilt every `recompute_interval` calls, or as soon
/// as the number of candidates changes, and published with a swap.
pub struct WeightedResponseTimeRule {
    stats: Arc<LoadBalancerStats>,
    table: ArcSwapOption<WeightTable>,
    calls: AtomicU64,
    recompute: Mutex<()>,
    round_robin: RoundRobinRule,

    recompute_interval: u64,
    min_gap_ms: f64,
}

impl WeightedResponseTimeRule {
    pub fn new(config: &WeightedConfig, stats: Arc<LoadBalancerStats>) -> Self {
        Self {
            stats,
            table: ArcSwapOption::empty(),
            calls: AtomicU64::new(0),
            recompute: Mutex::new(()),
            round_robin: RoundRobinRule::new(),

            recompute_interval: config.recompute_interval.max(1),
            min_gap_ms: config.min_gap_ms as f64,
        }
    }

    fn current_table(&self, candidates: &[Server]) -> Option<Arc<WeightTable>> {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed);
        let cached = self.table.load_full();
        let stale = match &cached {
            Some(table) => table.size != candidates.len() || calls % self.recompute_interval == 0,
            None => true,
        };
        if !stale {
            return cached;
        }

        // someone else is rebuilding, keep serving what we have
        let Ok(_guard) = self.recompute.try_lock() else {
            return cached.filter(|t| t.size == candidates.len());
        };

        let latencies: Vec<f64> = candidates
            .iter()
            .map(|s| self.stats.average_latency_ms(s).unwrap_or(0.0))
            .collect();
        let table = Arc::new(WeightTable::build(&latencies, self.min_gap_ms));
        debug!(
            "Rebuilt response time weights for {} servers: uniform={} total={}",
            table.size, table.uniform, table.total
        );
        self.table.store(Some(table.clone()));
        Some(table)
    }
}

impl Rule for WeightedResponseTimeRule {
    fn name(&self) -> &str {
        "WeightedResponse"
    }

    fn choose(&self, candidates: &[Server], _invocation: &Invocation) -> Option<Server> {
        if candidates.is_empty() {
            return None;
        }

        match self.current_table(candidates) {
            Some(table) if !table.uniform => {
                let r = rand::rng().random_range(0.0..table.total);
                Some(candidates[table.draw(r)].clone())
            }
            _ => self.round_robin.pick(candidates),
        }
    }
}
