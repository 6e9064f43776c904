//! Progress reporting contract.

use std::sync::{Mutex, PoisonError};

use crate::status::StreamStatus;

/// Receives `(processed_size, status)` on every state change of a job.
///
/// Calls for one job are serialized and `processed_size` never decreases.
/// Exactly one call carries a terminal status, and it is the last one.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, processed: u64, status: StreamStatus);
}

impl<F> ProgressReporter for F
where
    F: Fn(u64, StreamStatus) + Send + Sync,
{
    fn report(&self, processed: u64, status: StreamStatus) {
        self(processed, status)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _processed: u64, _status: StreamStatus) {}
}

/// Records every event, in order.
#[derive(Debug, Default)]
pub struct ProgressLog {
    events: Mutex<Vec<(u64, StreamStatus)>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(u64, StreamStatus)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn statuses(&self) -> Vec<StreamStatus> {
        self.events().into_iter().map(|(_, status)| status).collect()
    }

    pub fn last(&self) -> Option<(u64, StreamStatus)> {
        self.events().last().copied()
    }
}

impl ProgressReporter for ProgressLog {
    fn report(&self, processed: u64, status: StreamStatus) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((processed, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_closure_reporter() {
        let seen = AtomicU64::new(0);
        let reporter = |processed: u64, _status: StreamStatus| {
            seen.store(processed, Ordering::SeqCst);
        };
        reporter.report(42, StreamStatus::Processing);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_log_keeps_order() {
        let log = ProgressLog::new();
        log.report(1, StreamStatus::Processing);
        log.report(2, StreamStatus::Completed);
        assert_eq!(
            log.statuses(),
            vec![StreamStatus::Processing, StreamStatus::Completed]
        );
        assert_eq!(log.last(), Some((2, StreamStatus::Completed)));
    }
}
