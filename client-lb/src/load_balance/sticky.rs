use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mesh_core::config::StickyConfig;
use tracing::debug;

use super::{RoundRobinRule, Rule, Server};
use crate::invocation::Invocation;
use crate::stats::LoadBalancerStats;

struct Session {
    server: Option<Server>,
    last_access: Instant,
}

/// Keeps returning the same server until the session times out, the server
/// keeps failing or it disappears from the candidates.
///
/// The sticky pointer belongs to the load balancer, so every operation that
/// shares one load balancer also shares the session. Use operation
/// granularity when unrelated operations must not pin each other.
pub struct SessionStickinessRule {
    stats: Arc<LoadBalancerStats>,
    session: Mutex<Session>,
    round_robin: RoundRobinRule,

    session_timeout: Duration,
    failure_threshold: u32,
}

impl SessionStickinessRule {
    pub fn new(config: &StickyConfig, stats: Arc<LoadBalancerStats>) -> Self {
        Self {
            stats,
            session: Mutex::new(Session {
                server: None,
                last_access: Instant::now(),
            }),
            round_robin: RoundRobinRule::new(),

            session_timeout: config.session_timeout(),
            failure_threshold: config.failure_threshold,
        }
    }

    fn switch_reason(&self, session: &Session, candidates: &[Server], now: Instant) -> Option<&'static str> {
        let Some(server) = &session.server else {
            return Some("no session");
        };
        if now.saturating_duration_since(session.last_access) > self.session_timeout {
            return Some("session timeout");
        }
        if !candidates.contains(server) {
            return Some("server gone");
        }
        if self.failure_threshold > 0 && self.stats.continuous_failures(server) >= self.failure_threshold {
            return Some("failure threshold");
        }
        None
    }

    pub fn choose_at(&self, candidates: &[Server], now: Instant) -> Option<Server> {
        if candidates.is_empty() {
            return None;
        }

        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reason) = self.switch_reason(&session, candidates, now) {
            // the abandoned server starts over if it ever comes back to us
            if let Some(old) = session.server.take() {
                self.stats.reset_continuous_failures(&old);
            }
            let next = self.round_robin.pick(candidates)?;
            debug!("Sticky session switched to {} ({})", next, reason);
            session.server = Some(next);
        }
        session.last_access = now;
        session.server.clone()
    }
}

impl Rule for SessionStickinessRule {
    fn name(&self) -> &str {
        "SessionStickiness"
    }

    fn choose(&self, candidates: &[Server], _invocation: &Invocation) -> Option<Server> {
        self.choose_at(candidates, Instant::now())
    }
}
