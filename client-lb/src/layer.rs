use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use pin_project_lite::pin_project;
use tower::{Layer, Service};
use tracing::debug;

use crate::error::{CallError, LbError};
use crate::invocation::Invocation;
use crate::load_balance::Server;
use crate::outcome;
use crate::router::LoadBalanceRouter;
use crate::stats::ServerHealthStats;

/// An attempt in flight against a balanced server.
struct Tracked {
    server: Server,
    stats: Arc<ServerHealthStats>,
    started: Instant,
}

impl Tracked {
    fn finish(&self, result: Result<(), &CallError>) {
        let class = outcome::record(&self.stats, result, self.started.elapsed());
        debug!("Call to {} finished as {:?}", self.server, class);
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.stats.end_call();
    }
}

pin_project! {
    pub struct RecordOutcome<F> {
        #[pin]
        inner: Option<F>,
        error: Option<LbError>,
        tracked: Option<Tracked>,
    }
}

impl<F, Res> Future for RecordOutcome<F>
where
    F: Future<Output = Result<Res, CallError>>,
{
    type Output = Result<Res, LbError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let Some(inner) = this.inner.as_pin_mut() else {
            let err = this.error.take().unwrap_or(LbError::InvocationFinished);
            return Poll::Ready(Err(err));
        };

        let result = ready!(inner.poll(cx));
        if let Some(tracked) = this.tracked.take() {
            tracked.finish(result.as_ref().map(|_| ()));
        }
        Poll::Ready(result.map_err(LbError::from))
    }
}

/// Routes each invocation to a server before handing it to the next stage.
#[derive(Clone)]
pub struct LoadBalance<S> {
    inner: S,
    router: Arc<LoadBalanceRouter>,
}

impl<S> LoadBalance<S> {
    pub fn new(inner: S, router: Arc<LoadBalanceRouter>) -> Self {
        Self { inner, router }
    }
}

impl<S> Service<Invocation> for LoadBalance<S>
where
    S: Service<Invocation, Error = CallError>,
{
    type Response = S::Response;

    type Error = LbError;

    type Future = RecordOutcome<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LbError::from)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let server = match self.router.choose_server(&invocation) {
            Ok(server) => server,
            Err(e) => {
                return RecordOutcome {
                    inner: None,
                    error: Some(e),
                    tracked: None,
                };
            }
        };

        let tracked = if invocation.supplied_endpoint().is_none() {
            let stats = self.router.stats().stats_for(&server);
            stats.begin_call();
            Some(Tracked {
                server,
                stats,
                started: Instant::now(),
            })
        } else {
            None
        };

        RecordOutcome {
            inner: Some(self.inner.call(invocation)),
            error: None,
            tracked,
        }
    }
}

#[derive(Clone)]
pub struct LoadBalanceLayer {
    router: Arc<LoadBalanceRouter>,
}

impl LoadBalanceLayer {
    pub fn new(router: Arc<LoadBalanceRouter>) -> Self {
        Self { router }
    }
}

impl<S> Layer<S> for LoadBalanceLayer {
    type Service = LoadBalance<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadBalance::new(inner, self.router.clone())
    }
}
