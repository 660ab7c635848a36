use std::time::Duration;

use mesh_core::config::IsolationConfig;
use tracing::{debug, warn};

use crate::load_balance::Server;
use crate::ttl::TtlMap;

/// Time bounded exclusion list keyed by instance id.
///
/// An entry keeps its instance out of rotation until it expires, then the
/// first lookup drops it and lets the instance back in.
pub struct IsolationRegistry {
    entries: TtlMap<String, Duration>,
    config: IsolationConfig,
}

impl Default for IsolationRegistry {
    fn default() -> Self {
        Self::new(IsolationConfig::default())
    }
}

impl IsolationRegistry {
    pub fn new(config: IsolationConfig) -> Self {
        Self {
            entries: TtlMap::new(),
            config,
        }
    }

    pub fn isolate(&self, instance_id: &str, wait: Duration) {
        self.isolate_at(instance_id, wait, self.entries.now_ms());
    }

    /// Overwrites any previous isolation of the instance.
    pub fn isolate_at(&self, instance_id: &str, wait: Duration, now_ms: u64) {
        let wait = self.config.clamp_wait(wait);
        self.entries.insert_at(instance_id.to_string(), wait, wait, now_ms);
        let swept = self.entries.sweep_at(now_ms);
        warn!("Isolated instance {} for {:?}", instance_id, wait);
        if swept > 0 {
            debug!("Swept {} expired isolation entries", swept);
        }
    }

    pub fn recover(&self, instance_id: &str) -> bool {
        let recovered = self.entries.remove(&instance_id.to_string()).is_some();
        if recovered {
            warn!("Recovered instance {} from isolation", instance_id);
        }
        recovered
    }

    pub fn is_isolated(&self, instance_id: &str) -> bool {
        self.is_isolated_at(instance_id, self.entries.now_ms())
    }

    pub fn is_isolated_at(&self, instance_id: &str, now_ms: u64) -> bool {
        self.entries.contains_at(&instance_id.to_string(), now_ms)
    }

    pub fn filter(&self, candidates: Vec<Server>) -> Vec<Server> {
        self.filter_at(candidates, self.entries.now_ms())
    }

    /// Never turns a non-empty list into an empty one.
    pub fn filter_at(&self, candidates: Vec<Server>, now_ms: u64) -> Vec<Server> {
        if self.entries.is_empty() {
            return candidates;
        }

        let kept: Vec<Server> = candidates
            .iter()
            .filter(|s| !self.is_isolated_at(s.instance_id(), now_ms))
            .cloned()
            .collect();

        if kept.is_empty() && !candidates.is_empty() {
            return Self::fail_open(candidates);
        }
        kept
    }

    fn fail_open(candidates: Vec<Server>) -> Vec<Server> {
        warn!(
            "All {} candidates are isolated, ignoring isolation for this call",
            candidates.len()
        );
        candidates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
