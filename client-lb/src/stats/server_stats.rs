use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;

use super::Ewma;

const LATENCY_TAU_MS: f64 = 10_000.0;

const NO_TRIAL: u64 = u64::MAX;

struct Window {
    start_ms: u64,
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
}

impl Window {
    fn new(now_ms: u64) -> Self {
        Self {
            start_ms: now_ms,
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, now_ms: u64, window_ms: u64) -> bool {
        now_ms.saturating_sub(self.start_ms) >= window_ms
    }
}

/// Point in time view of one server's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerStatsSnapshot {
    pub continuous_failures: u32,
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    /// ms since the stats were created, 0 if never visited
    pub last_visit_ms: u64,
    pub isolated: bool,
}

impl ServerStatsSnapshot {
    /// Percentage of successful requests in the window, 0 without requests.
    pub fn success_rate(&self) -> u64 {
        if self.total_requests == 0 {
            return 0;
        }
        self.success_requests * 100 / self.total_requests
    }

    /// Percentage of failed requests in the window, 0 without requests.
    pub fn failed_rate(&self) -> u64 {
        if self.total_requests == 0 {
            return 0;
        }
        self.failed_requests * 100 / self.total_requests
    }
}

/// Health record of a single server.
///
/// The current window is published through an `ArcSwap`: readers never
/// block, and a rollover swaps in a fresh window with a compare and swap.
/// An increment racing a rollover may land in the retired window and be
/// lost, like any other relaxed update here.
pub struct ServerHealthStats {
    origin: Instant,
    window_ms: u64,
    window: ArcSwap<Window>,

    continuous_failures: AtomicU32,
    last_visit_ms: AtomicU64,
    isolated: AtomicBool,
    isolated_at_ms: AtomicU64,
    in_flight: AtomicUsize,
    /// start of the trial call of an isolated server, `NO_TRIAL` if none
    trial_started_ms: AtomicU64,

    latency: Ewma,
}

impl ServerHealthStats {
    pub fn new(window: Duration) -> Self {
        Self {
            origin: Instant::now(),
            window_ms: window.as_millis() as u64,
            window: ArcSwap::from_pointee(Window::new(0)),

            continuous_failures: AtomicU32::new(0),
            last_visit_ms: AtomicU64::new(0),
            isolated: AtomicBool::new(false),
            isolated_at_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            trial_started_ms: AtomicU64::new(NO_TRIAL),

            latency: Ewma::new(LATENCY_TAU_MS),
        }
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Window to count into, rolled over first if it ran out.
    fn current_window(&self, now_ms: u64) -> Arc<Window> {
        let current = self.window.load_full();
        if !current.is_expired(now_ms, self.window_ms) {
            return current;
        }
        // losers of the race count into the winner's window
        self.window.compare_and_swap(&current, Arc::new(Window::new(now_ms)));
        self.window.load_full()
    }

    pub fn mark_success(&self) {
        self.mark_success_at(self.now_ms());
    }

    pub fn mark_success_at(&self, now_ms: u64) {
        let w = self.current_window(now_ms);
        w.total.fetch_add(1, Ordering::Relaxed);
        w.success.fetch_add(1, Ordering::Relaxed);
        self.continuous_failures.store(0, Ordering::Relaxed);
        self.last_visit_ms.store(now_ms, Ordering::Relaxed);
        self.end_trial();
    }

    pub fn mark_failure(&self) {
        self.mark_failure_at(self.now_ms());
    }

    pub fn mark_failure_at(&self, now_ms: u64) {
        let w = self.current_window(now_ms);
        w.total.fetch_add(1, Ordering::Relaxed);
        w.failed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .continuous_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_add(1)));
        self.last_visit_ms.store(now_ms, Ordering::Relaxed);
        self.end_trial();
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        self.snapshot_at(self.now_ms())
    }

    pub fn snapshot_at(&self, now_ms: u64) -> ServerStatsSnapshot {
        let w = self.window.load();
        let (total_requests, success_requests, failed_requests) = if w.is_expired(now_ms, self.window_ms) {
            (0, 0, 0)
        } else {
            (
                w.total.load(Ordering::Relaxed),
                w.success.load(Ordering::Relaxed),
                w.failed.load(Ordering::Relaxed),
            )
        };
        ServerStatsSnapshot {
            continuous_failures: self.continuous_failures(),
            total_requests,
            success_requests,
            failed_requests,
            last_visit_ms: self.last_visit_ms(),
            isolated: self.is_isolated(),
        }
    }

    pub fn continuous_failures(&self) -> u32 {
        self.continuous_failures.load(Ordering::Relaxed)
    }

    pub fn reset_continuous_failures(&self) {
        self.continuous_failures.store(0, Ordering::Relaxed);
    }

    pub fn last_visit_ms(&self) -> u64 {
        self.last_visit_ms.load(Ordering::Relaxed)
    }

    pub fn note_response_time(&self, elapsed: Duration) {
        self.latency.update(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        self.latency.initialized().then(|| self.latency.get())
    }

    pub fn mark_isolated(&self, isolated: bool) {
        self.mark_isolated_at(isolated, self.now_ms());
    }

    pub fn mark_isolated_at(&self, isolated: bool, now_ms: u64) {
        if isolated {
            self.isolated_at_ms.store(now_ms, Ordering::Relaxed);
        }
        self.isolated.store(isolated, Ordering::Relaxed);
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::Relaxed)
    }

    pub fn isolated_at_ms(&self) -> u64 {
        self.isolated_at_ms.load(Ordering::Relaxed)
    }

    /// Claims the single trial call of an isolated server.
    ///
    /// Fails while another trial is running, unless that one started more
    /// than `stale_after_ms` ago without reporting back.
    pub fn try_begin_trial_at(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        self.trial_started_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |started| {
                (started == NO_TRIAL || now_ms.saturating_sub(started) > stale_after_ms).then_some(now_ms)
            })
            .is_ok()
    }

    pub fn end_trial(&self) {
        self.trial_started_ms.store(NO_TRIAL, Ordering::Release);
    }

    pub fn in_trial(&self) -> bool {
        self.trial_started_ms.load(Ordering::Acquire) != NO_TRIAL
    }

    pub fn begin_call(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_call(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}
