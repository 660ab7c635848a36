use rand::Rng;

use super::{Rule, Server};
use crate::invocation::Invocation;

pub struct RandomRule;

impl Rule for RandomRule {
    fn name(&self) -> &str {
        "Random"
    }

    fn choose(&self, candidates: &[Server], _invocation: &Invocation) -> Option<Server> {
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..candidates.len());
        Some(candidates[idx].clone())
    }
}
