//! The retrieval queue.
//!
//! Callers submit block requests with [`RetrievalQueue::request`]; workers
//! pull the highest-priority pending entry with
//! [`RetrievalQueue::work_on_request`] (or one of the blocking helpers), fetch
//! it, and hand it back to [`RetrievalQueue::finalize`].
//!
//! Heap, table and the list of waiting workers sit behind one mutex. Each
//! waiting worker registers a single-slot channel; an entry is popped only
//! when a worker is ready to take it, and the pop and the send happen in the
//! same critical section. A priority raise that lands before that moment
//! therefore always affects which entry goes out next.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::block::BlockPointer;
use crate::config::RetrievalConfig;
use crate::context::RequestContext;
use crate::error::{ConfigError, FetchError, RetrievalError};
use crate::heap::RetrievalHeap;
use crate::request::{PendingRequest, RequestId, RetrievalHandle};
use crate::retrieval::{DeliveryReport, Retrieval};
use crate::stats::RetrievalStats;
use crate::table::RetrievalTable;

/// A worker blocked on dispatch.
struct Waiter {
    id: u64,
    sender: Sender<Retrieval>,
}

struct QueueState {
    table: RetrievalTable,
    heap: RetrievalHeap,
    waiters: VecDeque<Waiter>,
    next_insertion_order: u64,
    next_waiter_id: u64,
    shutdown: bool,
}

/// Priority queue of block retrievals with request coalescing.
pub struct RetrievalQueue {
    state: Mutex<QueueState>,
    stats: RetrievalStats,
    config: RetrievalConfig,
}

impl RetrievalQueue {
    /// Create a queue serving `workers` concurrent workers.
    pub fn new(workers: usize) -> Result<Self, ConfigError> {
        Self::with_config(RetrievalConfig::with_workers(workers))
    }

    /// Create a queue from a full configuration.
    pub fn with_config(config: RetrievalConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(workers = config.workers, "Block retrieval queue created");
        Ok(Self {
            state: Mutex::new(QueueState {
                table: RetrievalTable::with_capacity(config.workers),
                heap: RetrievalHeap::new(),
                waiters: VecDeque::with_capacity(config.workers),
                next_insertion_order: 0,
                next_waiter_id: 0,
                shutdown: false,
            }),
            stats: RetrievalStats::new(),
            config,
        })
    }

    /// Request a block at the given priority (larger is more urgent).
    ///
    /// Joins the pending entry for `block` if there is one, raising its
    /// priority when `priority` is higher; otherwise creates a new entry.
    /// Never waits for the fetch. Fails without touching the queue if `ctx`
    /// is already canceled or expired, or if the queue is shut down.
    pub fn request(
        &self,
        ctx: &RequestContext,
        priority: i32,
        block: BlockPointer,
    ) -> Result<RetrievalHandle, RetrievalError> {
        if let Some(err) = ctx.err() {
            self.stats.record_rejected();
            debug!(block = %block, error = %err, "Rejected request with finished context");
            return Err(err);
        }

        let (reply, receiver) = oneshot::channel();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shutdown {
            self.stats.record_rejected();
            return Err(RetrievalError::Shutdown);
        }

        let insertion_order = state.next_insertion_order;
        state.next_insertion_order += 1;
        let id = RequestId::new(insertion_order);

        let request = PendingRequest::new(id, priority, ctx.clone(), reply);
        let admission = state.table.find_or_create(block, request);
        self.stats.record_request(admission.created);

        if admission.created {
            state.heap.push(&mut state.table, admission.slot);
            trace!(
                block = %block,
                priority,
                insertion_order,
                "Created retrieval"
            );
        } else {
            if admission.raised {
                if let Some(index) = state.table.get(admission.slot).and_then(Retrieval::heap_index) {
                    state.heap.fix(&mut state.table, index);
                }
                self.stats.record_preemption();
                debug!(
                    block = %block,
                    priority = admission.priority,
                    "Raised retrieval priority"
                );
            }
            trace!(
                block = %block,
                requests = admission.requests,
                insertion_order,
                "Coalesced request"
            );
        }

        self.dispatch_locked(state);
        drop(guard);

        Ok(RetrievalHandle::new(id, block, ctx.clone(), receiver))
    }

    /// Register as a worker and get the receiver the next entry arrives on.
    ///
    /// The receiver yields exactly one retrieval: the highest-priority
    /// pending entry at the moment one is available. It reports
    /// [`RetrievalError::Shutdown`] if the queue shuts down first. Dropping
    /// it withdraws the registration, and an entry already handed to it goes
    /// back into the queue with its ordering intact.
    pub fn work_on_request(&self) -> DispatchReceiver<'_> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let waiter_id = state.next_waiter_id;
        state.next_waiter_id += 1;
        // After shutdown the sender is dropped here and the receiver disconnects
        if !state.shutdown {
            state.waiters.push_back(Waiter { id: waiter_id, sender });
            self.dispatch_locked(state);
        }
        DispatchReceiver {
            queue: self,
            waiter_id,
            receiver,
        }
    }

    /// Block until an entry is available.
    pub fn next_retrieval(&self) -> Result<Retrieval, RetrievalError> {
        self.work_on_request().recv()
    }

    /// Block up to `timeout` for an entry. Returns `Ok(None)` on timeout.
    pub fn next_retrieval_timeout(&self, timeout: Duration) -> Result<Option<Retrieval>, RetrievalError> {
        self.work_on_request().recv_timeout(timeout)
    }

    /// Deliver a fetch result to every request coalesced onto `retrieval`.
    ///
    /// Callers whose context has since been canceled are still sent the
    /// result; their handle disregards it.
    pub fn finalize(&self, retrieval: Retrieval, result: Result<Bytes, FetchError>) -> DeliveryReport {
        let block = retrieval.block();
        let requests = retrieval.request_count();
        let age = retrieval.age();
        let success = result.is_ok();
        if let Err(ref e) = result {
            warn!(block = %block, requests, error = %e, "Block fetch failed");
        }

        let outcome = result.map_err(RetrievalError::Fetch);
        let report = retrieval.deliver(&outcome);
        self.stats
            .record_finalize(success, report.delivered, report.dropped);
        trace!(
            block = %block,
            delivered = report.delivered,
            dropped = report.dropped,
            age_ms = age.as_millis(),
            "Finalized retrieval"
        );
        report
    }

    /// Stop the queue.
    ///
    /// New requests are rejected, waiting workers are released and every
    /// pending entry's callers receive [`RetrievalError::Shutdown`].
    /// Entries already in flight are unaffected and can still be finalized.
    pub fn shutdown(&self) {
        let drained = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.waiters.clear();
            state.heap.clear(&mut state.table);
            state.table.drain()
        };

        let pending = drained.len();
        for retrieval in drained {
            retrieval.deliver(&Err(RetrievalError::Shutdown));
        }
        info!(pending, "Block retrieval queue shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Number of entries waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Number of workers registered and waiting for an entry.
    pub fn waiting_workers(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Whether `block` has a pending (not yet dispatched) entry.
    pub fn is_pending(&self, block: &BlockPointer) -> bool {
        self.state.lock().table.find(block).is_some()
    }

    pub fn stats(&self) -> &RetrievalStats {
        &self.stats
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Hand pending entries to waiting workers while both exist.
    fn dispatch_locked(&self, state: &mut QueueState) {
        while !state.heap.is_empty() {
            let Some(waiter) = state.waiters.pop_front() else {
                return;
            };
            let Some(retrieval) = state
                .heap
                .pop(&mut state.table)
                .and_then(|slot| state.table.take(slot))
            else {
                state.waiters.push_front(waiter);
                return;
            };

            let block = retrieval.block();
            let priority = retrieval.priority();
            let insertion_order = retrieval.insertion_order();
            let age = retrieval.age();
            match waiter.sender.try_send(retrieval) {
                Ok(()) => {
                    self.stats.record_dispatch();
                    trace!(
                        block = %block,
                        priority,
                        insertion_order,
                        waiter = waiter.id,
                        queued_us = age.as_micros(),
                        "Dispatched retrieval"
                    );
                }
                Err(TrySendError::Disconnected(retrieval) | TrySendError::Full(retrieval)) => {
                    // Worker gave up; requeue with the same ordering
                    self.stats.record_handoff_failed();
                    trace!(block = %block, waiter = waiter.id, "Worker gone, requeueing retrieval");
                    let slot = state.table.restore(retrieval);
                    state.heap.push(&mut state.table, slot);
                }
            }
        }
    }
}

/// A worker's registration for the next dispatched entry.
///
/// Returned by [`RetrievalQueue::work_on_request`]. Dropping it unregisters
/// the worker; an entry that was handed over but never received is put back
/// into the queue.
pub struct DispatchReceiver<'a> {
    queue: &'a RetrievalQueue,
    waiter_id: u64,
    receiver: Receiver<Retrieval>,
}

impl DispatchReceiver<'_> {
    /// Block until an entry is handed over.
    pub fn recv(&self) -> Result<Retrieval, RetrievalError> {
        self.receiver.recv().map_err(|_| RetrievalError::Shutdown)
    }

    /// Block up to `timeout`. Returns `Ok(None)` on timeout; the registration
    /// stays in place until the receiver is dropped.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Retrieval>, RetrievalError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(retrieval) => Ok(Some(retrieval)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RetrievalError::Shutdown),
        }
    }

    /// Take the entry if one has already been handed over.
    pub fn try_recv(&self) -> Option<Retrieval> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for DispatchReceiver<'_> {
    fn drop(&mut self) {
        let orphan = {
            let mut guard = self.queue.state.lock();
            let state = &mut *guard;
            // Unregister first so a requeued entry cannot come straight back here
            state.waiters.retain(|w| w.id != self.waiter_id);
            let Ok(retrieval) = self.receiver.try_recv() else {
                return;
            };
            self.queue.stats.record_handoff_failed();
            trace!(
                block = %retrieval.block(),
                waiter = self.waiter_id,
                "Dispatched retrieval never received, requeueing"
            );
            if state.shutdown {
                Some(retrieval)
            } else {
                requeue_locked(state, retrieval);
                self.queue.dispatch_locked(state);
                None
            }
        };

        // The queue was drained while the entry sat in this receiver
        if let Some(retrieval) = orphan {
            retrieval.deliver(&Err(RetrievalError::Shutdown));
        }
    }
}

/// Put a handed-over entry back into the heap.
///
/// Requests for the block that arrived after the handoff created a new entry;
/// it is merged into the returned one, which keeps the earlier insertion order.
fn requeue_locked(state: &mut QueueState, mut retrieval: Retrieval) {
    if let Some(slot) = state.table.find(&retrieval.block()) {
        if let Some(index) = state.table.get(slot).and_then(Retrieval::heap_index) {
            state.heap.remove(&mut state.table, index);
        }
        if let Some(later) = state.table.take(slot) {
            retrieval.absorb(later);
        }
    }
    let slot = state.table.restore(retrieval);
    state.heap.push(&mut state.table, slot);
}

impl std::fmt::Debug for DispatchReceiver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchReceiver")
            .field("waiter_id", &self.waiter_id)
            .field("ready", &!self.receiver.is_empty())
            .finish_non_exhaustive()
    }
}

impl Drop for RetrievalQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RetrievalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RetrievalQueue")
            .field("pending", &state.table.len())
            .field("waiting_workers", &state.waiters.len())
            .field("next_insertion_order", &state.next_insertion_order)
            .field("shutdown", &state.shutdown)
            .finish_non_exhaustive()
    }
}
