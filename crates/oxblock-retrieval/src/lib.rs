//! Block retrieval scheduling for content-addressed filesystems.
//!
//! Many callers ask for blocks concurrently. This crate decides which block
//! is fetched next and makes sure concurrent requests for the same block are
//! served by a single fetch.
//!
//! # Architecture
//!
//! ```text
//!  callers                     RetrievalQueue (one mutex)                 workers
//!  ───────                ─────────────────────────────────────           ───────
//!  request(ctx, p, blk) ─▶│ table: BlockPointer → Retrieval   │
//!                         │   (coalesces, raises priority)    │
//!                         │ heap:  priority desc, order asc   │◀─ work_on_request()
//!                         │ waiters: single-slot channels     │── Retrieval ─▶ fetch
//!                         └───────────────────────────────────┘                  │
//!  RetrievalHandle ◀──── one outcome per request ◀──── finalize(retrieval, result)
//! ```
//!
//! An entry is popped from the heap only once a worker is waiting, inside
//! the same critical section that hands it over. Once handed over it is in
//! flight: it can no longer be joined or reprioritized, and a new request
//! for the block creates a fresh entry.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use oxblock_retrieval::{
//!     BlockPointer, FetchContext, FetchError, RequestContext, RetrievalQueue,
//!     RetrievalWorkerPool,
//! };
//!
//! let queue = Arc::new(RetrievalQueue::new(4)?);
//! let pool = RetrievalWorkerPool::start(
//!     Arc::clone(&queue),
//!     |_ctx: &FetchContext, block: &BlockPointer| -> Result<Bytes, FetchError> {
//!         Ok(Bytes::from(block.to_string()))
//!     },
//! )?;
//!
//! let block = BlockPointer::for_content(b"hello");
//! let handle = queue.request(&RequestContext::background(), 1, block)?;
//! let contents = handle.blocking_recv()?;
//! assert!(!contents.is_empty());
//!
//! pool.wait();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod block;
pub mod config;
pub mod context;
pub mod error;
mod heap;
pub mod queue;
pub mod request;
pub mod retrieval;
pub mod stats;
mod table;
pub mod worker;

pub use block::{BlockId, BlockPointer};
pub use config::RetrievalConfig;
pub use context::RequestContext;
pub use error::{ConfigError, FetchError, RetrievalError};
pub use queue::{DispatchReceiver, RetrievalQueue};
pub use request::{PendingRequest, RequestId, RetrievalHandle, RetrievalOutcome};
pub use retrieval::{DeliveryReport, Retrieval};
pub use stats::{RetrievalStats, RetrievalStatsSnapshot};
pub use worker::{BlockFetcher, FetchContext, RetrievalWorkerPool};
