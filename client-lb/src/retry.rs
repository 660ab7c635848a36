use std::future::{Ready, ready};

use mesh_core::config::RetryConfig;
use tracing::{debug, info};

use crate::Result;
use crate::error::LbError;
use crate::invocation::Invocation;
use crate::load_balance::{LoadBalancer, Server};

/// Draws spent looking for a server other than the last one.
pub const DEFAULT_MAX_DRAWS: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    SameServer,
    NextServer,
}

/// Retry bookkeeping of one invocation.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    enabled: bool,
    /// set while the current attempt is a retry
    mode: Option<RetryMode>,
    last_server: Option<Server>,
    same_remaining: u32,
    next_remaining: u32,
}

impl RetryContext {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            mode: None,
            last_server: None,
            same_remaining: config.on_same,
            next_remaining: config.on_next,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_retry(&self) -> bool {
        self.mode.is_some()
    }

    pub fn mode(&self) -> Option<RetryMode> {
        self.mode
    }

    pub fn last_server(&self) -> Option<&Server> {
        self.last_server.as_ref()
    }

    pub fn set_last_server(&mut self, server: Server) {
        self.last_server = Some(server);
    }

    pub fn remaining(&self) -> (u32, u32) {
        (self.same_remaining, self.next_remaining)
    }

    /// Spends one unit of budget on the next attempt, same server first.
    pub fn begin_retry(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.same_remaining > 0 {
            self.same_remaining -= 1;
            self.mode = Some(RetryMode::SameServer);
            true
        } else if self.next_remaining > 0 {
            self.next_remaining -= 1;
            self.mode = Some(RetryMode::NextServer);
            true
        } else {
            false
        }
    }
}

/// Chooses the server of every attempt of an invocation.
#[derive(Debug, Clone, Copy)]
pub struct RetryCoordinator {
    max_draws: usize,
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DRAWS)
    }
}

impl RetryCoordinator {
    pub fn new(max_draws: usize) -> Self {
        Self {
            max_draws: max_draws.max(1),
        }
    }

    pub fn choose(&self, invocation: &Invocation, lb: &LoadBalancer) -> Result<Server> {
        let retry = invocation.retry_context();
        let (mode, last) = match &retry {
            Some(ctx) if ctx.is_retry() => (ctx.mode(), ctx.last_server().cloned()),
            _ => (None, None),
        };

        let server = match (mode, last) {
            (Some(mode), Some(last)) => {
                if invocation.is_finished() {
                    return Err(LbError::InvocationFinished);
                }
                let server = match mode {
                    RetryMode::SameServer => last.clone(),
                    RetryMode::NextServer => self.draw_other(invocation, lb, &last),
                };
                info!(
                    "Retrying {} on {} ({:?}), last server {}",
                    invocation.service(),
                    server,
                    mode,
                    last
                );
                server
            }
            _ => lb.choose_server(invocation)?,
        };

        invocation.with_retry_context(|ctx| ctx.set_last_server(server.clone()));
        Ok(server)
    }

    /// Falls back to `last` when every draw hit it or the list ran dry.
    fn draw_other(&self, invocation: &Invocation, lb: &LoadBalancer, last: &Server) -> Server {
        for _ in 0..self.max_draws {
            match lb.choose_server(invocation) {
                Ok(server) if server != *last => return server,
                Ok(_) => {}
                Err(e) => {
                    debug!("Draw for a server other than {} failed: {}", last, e);
                    break;
                }
            }
        }
        debug!("No server other than {} found, retrying on it", last);
        last.clone()
    }
}

/// `tower` retry policy for a service that routes through the load balancer.
///
/// Only server attributable failures are retried, and only while the
/// invocation's retry budget lasts. The retried clone shares the context, so
/// the next pass through the middleware sees the new retry mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl<Res> tower::retry::Policy<Invocation, Res, LbError> for RetryPolicy {
    type Future = Ready<()>;

    fn retry(&mut self, req: &mut Invocation, result: &mut std::result::Result<Res, LbError>) -> Option<Self::Future> {
        let err = result.as_ref().err()?;
        if !err.is_retryable() || req.is_finished() {
            return None;
        }
        req.with_retry_context(|ctx| ctx.begin_retry())
            .unwrap_or(false)
            .then(|| ready(()))
    }

    fn clone_request(&mut self, req: &Invocation) -> Option<Invocation> {
        Some(req.clone())
    }
}
