//! Retrieval entries: the unit the queue schedules and workers fetch.

use std::fmt;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::block::BlockPointer;
use crate::request::{PendingRequest, RetrievalOutcome};
use crate::worker::FetchContext;

/// A pending or in-flight fetch of one block, with every request coalesced
/// onto it.
///
/// While pending, the entry lives in the queue. Once dispatched, the worker
/// that received it owns it and must hand it back through
/// [`RetrievalQueue::finalize`](crate::RetrievalQueue::finalize). An entry
/// dropped without being finalized reports
/// [`RetrievalError::Abandoned`](crate::RetrievalError::Abandoned) to its
/// callers.
pub struct Retrieval {
    block: BlockPointer,
    priority: i32,
    insertion_order: u64,
    heap_index: Option<usize>,
    requests: Vec<PendingRequest>,
    created_at: Instant,
}

/// Outcome of fanning a result out to an entry's requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Requests whose handle received the outcome.
    pub delivered: usize,
    /// Requests whose handle had already been dropped.
    pub dropped: usize,
}

impl Retrieval {
    /// New entry whose priority and insertion order come from its first request.
    pub(crate) fn new(block: BlockPointer, first: PendingRequest) -> Self {
        Self {
            block,
            priority: first.priority(),
            insertion_order: first.insertion_order(),
            heap_index: None,
            requests: vec![first],
            created_at: Instant::now(),
        }
    }

    /// The block this entry fetches.
    pub fn block(&self) -> BlockPointer {
        self.block
    }

    /// Highest priority among attached requests.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Sequence number assigned when the entry was created.
    pub fn insertion_order(&self) -> u64 {
        self.insertion_order
    }

    /// Position in the priority heap. `None` once dispatched.
    pub fn heap_index(&self) -> Option<usize> {
        self.heap_index
    }

    /// Requests coalesced onto this entry, in arrival order.
    pub fn requests(&self) -> &[PendingRequest] {
        &self.requests
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Whether every attached caller has already given up.
    pub fn is_abandoned(&self) -> bool {
        self.requests.iter().all(PendingRequest::is_abandoned)
    }

    /// Time since the entry was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Context handed to the block fetcher for this entry.
    pub fn fetch_context(&self) -> FetchContext {
        FetchContext::new(
            self.block,
            self.priority,
            self.insertion_order,
            self.requests.iter().map(|r| r.context().clone()).collect(),
        )
    }

    /// Dispatch order: higher priority first, then earlier insertion.
    pub(crate) fn precedes(&self, other: &Self) -> bool {
        self.priority > other.priority
            || (self.priority == other.priority && self.insertion_order < other.insertion_order)
    }

    /// Append a request. Returns true if it raised the entry's priority.
    pub(crate) fn attach(&mut self, request: PendingRequest) -> bool {
        let raised = request.priority() > self.priority;
        if raised {
            self.priority = request.priority();
        }
        self.requests.push(request);
        raised
    }

    /// Fold in a later entry for the same block, keeping this entry's order.
    pub(crate) fn absorb(&mut self, mut later: Self) {
        self.priority = self.priority.max(later.priority);
        self.requests.append(&mut later.requests);
    }

    pub(crate) fn set_heap_index(&mut self, index: Option<usize>) {
        self.heap_index = index;
    }

    /// Send `outcome` to every attached request, in arrival order.
    pub(crate) fn deliver(mut self, outcome: &RetrievalOutcome) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for request in std::mem::take(&mut self.requests) {
            if request.deliver(outcome.clone()) {
                report.delivered += 1;
            } else {
                report.dropped += 1;
            }
        }
        report
    }
}

impl Drop for Retrieval {
    fn drop(&mut self) {
        if !self.requests.is_empty() {
            warn!(
                block = %self.block,
                requests = self.requests.len(),
                "Retrieval dropped without a result"
            );
        }
    }
}

impl fmt::Debug for Retrieval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrieval")
            .field("block", &self.block)
            .field("priority", &self.priority)
            .field("insertion_order", &self.insertion_order)
            .field("heap_index", &self.heap_index)
            .field("requests", &self.requests.len())
            .finish_non_exhaustive()
    }
}
