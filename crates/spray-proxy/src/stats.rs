//! Atomic proxy statistics counters.
//!
//! All atomics use `Relaxed` ordering; these are monotonic display counters
//! with no synchronization requirements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Default)]
struct StatsInner {
    requests: AtomicU64,
    requests_without_backends: AtomicU64,
    deliveries_attempted: AtomicU64,
    deliveries_succeeded: AtomicU64,
    deliveries_failed: AtomicU64,
}

/// Thread-safe fan-out statistics. Cheap to clone (Arc).
#[derive(Clone, Default)]
pub struct ProxyStats {
    inner: Arc<StatsInner>,
}

/// Snapshot of current stats values, serializable to JSON.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub requests_without_backends: u64,
    pub deliveries_attempted: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_without_backends(&self) {
        self.inner
            .requests_without_backends
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_attempted(&self) {
        self.inner.deliveries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished delivery. A backend answering with any HTTP status
    /// counts as delivered.
    pub fn record_outcome(&self, delivered: bool) {
        let counter = if delivered {
            &self.inner.deliveries_succeeded
        } else {
            &self.inner.deliveries_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.inner.requests.load(Ordering::Relaxed),
            requests_without_backends: self.inner.requests_without_backends.load(Ordering::Relaxed),
            deliveries_attempted: self.inner.deliveries_attempted.load(Ordering::Relaxed),
            deliveries_succeeded: self.inner.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_failed: self.inner.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}
