//! Retrieval queue statistics.
//!
//! Counters are updated with relaxed atomics from the request, dispatch and
//! finalize paths. [`RetrievalStats::snapshot`] produces a serializable
//! point-in-time copy.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one retrieval queue.
#[derive(Debug, Default)]
pub struct RetrievalStats {
    /// Requests accepted (created or joined an entry).
    pub requests: AtomicU64,
    /// Requests that created a new entry.
    pub created: AtomicU64,
    /// Requests that joined an existing pending entry.
    pub coalesced: AtomicU64,
    /// Joining requests that raised an entry's priority.
    pub preemptions: AtomicU64,
    /// Requests rejected up front (context done or queue shut down).
    pub rejected: AtomicU64,
    /// Entries handed to a worker.
    pub dispatched: AtomicU64,
    /// Handoffs that failed because the consumer was gone.
    pub handoffs_failed: AtomicU64,
    /// Entries finalized by a worker.
    pub finalized: AtomicU64,
    /// Finalizations carrying a fetch error.
    pub fetch_failures: AtomicU64,
    /// Outcomes written to a caller's handle.
    pub deliveries: AtomicU64,
    /// Outcomes whose caller handle was already dropped.
    pub dropped_deliveries: AtomicU64,
    /// Fetches timed by the worker pool.
    pub fetches_timed: AtomicU64,
    /// Total fetch time across timed fetches.
    pub total_fetch_nanos: AtomicU64,
}

impl RetrievalStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted request.
    pub fn record_request(&self, created: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if created {
            self.created.fetch_add(1, Ordering::Relaxed);
        } else {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handoff_failed(&self) {
        self.handoffs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finalization and how its outcome was delivered.
    pub fn record_finalize(&self, success: bool, delivered: usize, dropped: usize) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.dropped_deliveries
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// Record the wall time of one fetch.
    pub fn record_fetch_time(&self, duration: Duration) {
        // Truncation is acceptable - a single fetch will not take 584 years
        #[allow(clippy::cast_possible_truncation)]
        let nanos = duration.as_nanos() as u64;
        self.fetches_timed.fetch_add(1, Ordering::Relaxed);
        self.total_fetch_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Fraction of accepted requests served by an already pending entry.
    pub fn dedup_ratio(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        self.coalesced.load(Ordering::Relaxed) as f64 / requests as f64
    }

    /// Average fetch time.
    pub fn avg_fetch_time(&self) -> Duration {
        let timed = self.fetches_timed.load(Ordering::Relaxed);
        if timed == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_fetch_nanos.load(Ordering::Relaxed) / timed)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> RetrievalStatsSnapshot {
        RetrievalStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handoffs_failed: self.handoffs_failed.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
            dedup_ratio: self.dedup_ratio(),
            avg_fetch_time: self.avg_fetch_time(),
        }
    }
}

/// A serializable snapshot of retrieval statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalStatsSnapshot {
    pub requests: u64,
    pub created: u64,
    pub coalesced: u64,
    pub preemptions: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub handoffs_failed: u64,
    pub finalized: u64,
    pub fetch_failures: u64,
    pub deliveries: u64,
    pub dropped_deliveries: u64,
    /// Coalesced requests as a fraction of accepted requests.
    pub dedup_ratio: f64,
    /// Average fetch time across timed fetches.
    #[serde(with = "humantime_serde")]
    pub avg_fetch_time: Duration,
}

impl RetrievalStatsSnapshot {
    /// Entries created but not yet finalized (pending or in flight).
    pub fn outstanding(&self) -> u64 {
        self.created.saturating_sub(self.finalized)
    }
}
