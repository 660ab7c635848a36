use std::time::Duration;

use crate::error::CallError;
use crate::stats::ServerHealthStats;

/// Status used for failures raised on the consumer side before anything hit the wire.
pub const CONSUMER_INNER_STATUS: u16 = 490;

/// How a finished call is accounted against the server that served it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    Success,
    /// counts against the server health
    ServerFailure,
    /// the server answered, the caller is to blame
    BusinessFailure,
}

/// Timeouts, connection level failures, 408/490/502/503 and unclassified
/// transport errors are the server's fault. Any other status is a business
/// answer from a healthy server.
pub fn is_server_attributable_failure(err: &CallError) -> bool {
    match err {
        CallError::Timeout
        | CallError::ConnectionRefused(_)
        | CallError::Unreachable(_)
        | CallError::ConsumerInner(_)
        | CallError::Transport(_) => true,
        CallError::Status { status, .. } => {
            matches!(*status, 408 | 502 | 503) || *status == CONSUMER_INNER_STATUS
        }
    }
}

pub fn classify(result: Result<(), &CallError>) -> OutcomeClass {
    match result {
        Ok(()) => OutcomeClass::Success,
        Err(e) if is_server_attributable_failure(e) => OutcomeClass::ServerFailure,
        Err(_) => OutcomeClass::BusinessFailure,
    }
}

/// Folds one finished call into the server's stats.
///
/// Latency is always noted. Business failures stop there and never touch
/// the health counters.
pub fn record(stats: &ServerHealthStats, result: Result<(), &CallError>, elapsed: Duration) -> OutcomeClass {
    stats.note_response_time(elapsed);
    let class = classify(result);
    match class {
        OutcomeClass::Success => stats.mark_success(),
        OutcomeClass::ServerFailure => stats.mark_failure(),
        OutcomeClass::BusinessFailure => stats.end_trial(),
    }
    class
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> CallError {
        CallError::Status {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_attributable_failures() {
        assert!(is_server_attributable_failure(&CallError::Timeout));
        assert!(is_server_attributable_failure(&CallError::ConnectionRefused("a".into())));
        assert!(is_server_attributable_failure(&CallError::Unreachable("a".into())));
        assert!(is_server_attributable_failure(&CallError::ConsumerInner("a".into())));
        assert!(is_server_attributable_failure(&CallError::Transport("reset".into())));
        assert!(is_server_attributable_failure(&status(408)));
        assert!(is_server_attributable_failure(&status(CONSUMER_INNER_STATUS)));
        assert!(is_server_attributable_failure(&status(502)));
        assert!(is_server_attributable_failure(&status(503)));
    }

    #[test]
    fn test_business_failures_are_not_attributable() {
        for code in [400, 401, 403, 404, 409, 422, 500] {
            assert!(!is_server_attributable_failure(&status(code)), "status {}", code);
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(Ok(())), OutcomeClass::Success);
        assert_eq!(classify(Err(&CallError::Timeout)), OutcomeClass::ServerFailure);
        assert_eq!(classify(Err(&status(400))), OutcomeClass::BusinessFailure);
    }

    #[test]
    fn test_record_business_failure_keeps_health() {
        let stats = ServerHealthStats::new(Duration::from_secs(60));
        stats.mark_failure();
        stats.mark_failure();

        let class = record(&stats, Err(&status(400)), Duration::from_millis(12));
        assert_eq!(class, OutcomeClass::BusinessFailure);
        let snap = stats.snapshot();
        assert_eq!(snap.continuous_failures, 2);
        assert_eq!(snap.total_requests, 2);
        assert_eq!(stats.average_latency_ms(), Some(12.0));

        record(&stats, Err(&CallError::Timeout), Duration::from_millis(12));
        assert_eq!(stats.snapshot().continuous_failures, 3);

        record(&stats, Ok(()), Duration::from_millis(12));
        assert_eq!(stats.snapshot().continuous_failures, 0);
    }
}
