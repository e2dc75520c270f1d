//! Worker pool draining a retrieval queue.
//!
//! Each worker is a named OS thread that loops: wait for the next entry,
//! run the [`BlockFetcher`], finalize. Workers wait with a bounded timeout
//! so they notice the pool's shutdown flag even when the queue is idle.

use bytes::Bytes;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

use crate::block::BlockPointer;
use crate::context::RequestContext;
use crate::error::FetchError;
use crate::queue::RetrievalQueue;
use crate::retrieval::Retrieval;

/// Fetches one block's contents from wherever blocks live.
///
/// Errors are opaque to the queue and forwarded unchanged to every caller
/// coalesced onto the retrieval.
pub trait BlockFetcher: Send + Sync {
    fn fetch(&self, ctx: &FetchContext, block: &BlockPointer) -> Result<Bytes, FetchError>;
}

impl<F> BlockFetcher for F
where
    F: Fn(&FetchContext, &BlockPointer) -> Result<Bytes, FetchError> + Send + Sync,
{
    fn fetch(&self, ctx: &FetchContext, block: &BlockPointer) -> Result<Bytes, FetchError> {
        self(ctx, block)
    }
}

/// What a fetcher knows about the retrieval it is serving.
///
/// The queue never aborts a fetch on cancellation. A fetcher may check
/// [`all_canceled`](Self::all_canceled) and skip work nobody is waiting for.
#[derive(Debug, Clone)]
pub struct FetchContext {
    block: BlockPointer,
    priority: i32,
    insertion_order: u64,
    callers: Vec<RequestContext>,
}

impl FetchContext {
    pub(crate) fn new(
        block: BlockPointer,
        priority: i32,
        insertion_order: u64,
        callers: Vec<RequestContext>,
    ) -> Self {
        Self {
            block,
            priority,
            insertion_order,
            callers,
        }
    }

    pub fn block(&self) -> BlockPointer {
        self.block
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn insertion_order(&self) -> u64 {
        self.insertion_order
    }

    /// Contexts of every caller coalesced onto the retrieval.
    pub fn callers(&self) -> &[RequestContext] {
        &self.callers
    }

    /// Whether every caller's context is canceled or expired.
    pub fn all_canceled(&self) -> bool {
        self.callers.iter().all(RequestContext::is_done)
    }

    /// The latest caller deadline, or `None` if any caller has no deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.callers
            .iter()
            .map(RequestContext::deadline)
            .try_fold(None, |latest: Option<Instant>, deadline| {
                deadline.map(|d| Some(latest.map_or(d, |l| l.max(d))))
            })
            .flatten()
    }
}

/// Pool of threads fetching blocks for a [`RetrievalQueue`].
///
/// Stopping the pool does not shut down the queue; pending entries stay
/// queued for whoever drains it next.
pub struct RetrievalWorkerPool {
    queue: Arc<RetrievalQueue>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl RetrievalWorkerPool {
    /// Start `queue.config().workers` workers running `fetcher`.
    pub fn start<F>(queue: Arc<RetrievalQueue>, fetcher: F) -> io::Result<Self>
    where
        F: BlockFetcher + 'static,
    {
        Self::start_shared(queue, Arc::new(fetcher))
    }

    /// Like [`start`](Self::start) with an already shared fetcher.
    pub fn start_shared(queue: Arc<RetrievalQueue>, fetcher: Arc<dyn BlockFetcher>) -> io::Result<Self> {
        let num_workers = queue.config().workers;
        let poll_interval = queue.config().worker_poll_interval;
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let queue = Arc::clone(&queue);
            let fetcher = Arc::clone(&fetcher);
            let flag = Arc::clone(&shutdown);
            let spawned = thread::Builder::new()
                .name(format!("block-retrieval-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, &queue, fetcher.as_ref(), &flag, poll_interval);
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to spawn retrieval worker");
                    shutdown.store(true, Ordering::Release);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(workers = num_workers, "Block retrieval workers started");

        Ok(Self {
            queue,
            workers,
            shutdown,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queue(&self) -> &Arc<RetrievalQueue> {
        &self.queue
    }

    /// Signal workers to stop after their current fetch.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stop and wait for all workers to exit.
    pub fn wait(mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Retrieval worker thread panicked");
            }
        }
        info!("Block retrieval workers stopped");
    }
}

impl Drop for RetrievalWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker_id: usize,
    queue: &RetrievalQueue,
    fetcher: &dyn BlockFetcher,
    shutdown: &AtomicBool,
    poll_interval: Duration,
) {
    debug!(worker_id, "Retrieval worker started");

    while !shutdown.load(Ordering::Acquire) {
        match queue.next_retrieval_timeout(poll_interval) {
            Ok(Some(retrieval)) => run_fetch(worker_id, queue, fetcher, retrieval),
            Ok(None) => {}
            Err(_) => break,
        }
    }

    debug!(worker_id, "Retrieval worker stopped");
}

fn run_fetch(worker_id: usize, queue: &RetrievalQueue, fetcher: &dyn BlockFetcher, retrieval: Retrieval) {
    let ctx = retrieval.fetch_context();
    let block = retrieval.block();
    trace!(
        worker_id,
        block = %block,
        priority = ctx.priority(),
        insertion_order = ctx.insertion_order(),
        callers = ctx.callers().len(),
        "Fetching block"
    );

    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| fetcher.fetch(&ctx, &block)))
        .unwrap_or_else(|_| {
            error!(worker_id, block = %block, "Block fetcher panicked");
            Err(FetchError::msg("block fetcher panicked"))
        });
    queue.stats().record_fetch_time(start.elapsed());

    queue.finalize(retrieval, result);
}
