use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Rule, Server};
use crate::invocation::Invocation;

pub struct RoundRobinRule {
    cursor: AtomicUsize,
}

impl Default for RoundRobinRule {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinRule {
    pub fn new() -> Self {
        Self::with_cursor(0)
    }

    pub fn with_cursor(start: usize) -> Self {
        Self {
            cursor: AtomicUsize::new(start),
        }
    }

    /// `fetch_add` wraps on overflow, the index stays in range.
    pub fn pick(&self, candidates: &[Server]) -> Option<Server> {
        if candidates.is_empty() {
            return None;
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(candidates[idx % candidates.len()].clone())
    }
}

impl Rule for RoundRobinRule {
    fn name(&self) -> &str {
        "RoundRobin"
    }

    fn choose(&self, candidates: &[Server], _invocation: &Invocation) -> Option<Server> {
        self.pick(candidates)
    }
}
