//! Caller requests and their result handles.
//!
//! Every call to [`RetrievalQueue::request`](crate::RetrievalQueue::request)
//! produces one [`PendingRequest`], attached to a retrieval, and one
//! [`RetrievalHandle`] returned to the caller. The two are linked by a
//! single-write channel that the finalizer fills exactly once.

use bytes::Bytes;
use std::fmt;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::block::BlockPointer;
use crate::context::RequestContext;
use crate::error::RetrievalError;

/// Outcome delivered to a caller: the block contents or the reason there are none.
pub type RetrievalOutcome = Result<Bytes, RetrievalError>;

/// Unique identifier for a request.
///
/// Equal to the insertion order the queue assigned to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// One caller's ask, as held by a pending retrieval.
pub struct PendingRequest {
    id: RequestId,
    priority: i32,
    context: RequestContext,
    reply: oneshot::Sender<RetrievalOutcome>,
}

impl PendingRequest {
    pub(crate) fn new(
        id: RequestId,
        priority: i32,
        context: RequestContext,
        reply: oneshot::Sender<RetrievalOutcome>,
    ) -> Self {
        Self {
            id,
            priority,
            context,
            reply,
        }
    }

    /// Request identifier.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Priority the caller asked for.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Insertion order assigned to the call.
    pub fn insertion_order(&self) -> u64 {
        self.id.raw()
    }

    /// The caller's context.
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Whether the caller has already given up on the result.
    pub fn is_abandoned(&self) -> bool {
        self.context.is_done() || self.reply.is_closed()
    }

    /// Write the outcome. Returns false if the caller's handle is gone.
    pub(crate) fn deliver(self, outcome: RetrievalOutcome) -> bool {
        self.reply.send(outcome).is_ok()
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("canceled", &self.context.is_canceled())
            .finish_non_exhaustive()
    }
}

/// Caller's receiving side of a block request.
///
/// Receives exactly one outcome. If the caller's own context is canceled or
/// expired by the time the outcome is read, the handle reports the context
/// error and disregards the delivered value. Other callers coalesced onto the
/// same retrieval are unaffected.
pub struct RetrievalHandle {
    id: RequestId,
    block: BlockPointer,
    context: RequestContext,
    receiver: oneshot::Receiver<RetrievalOutcome>,
}

impl RetrievalHandle {
    pub(crate) fn new(
        id: RequestId,
        block: BlockPointer,
        context: RequestContext,
        receiver: oneshot::Receiver<RetrievalOutcome>,
    ) -> Self {
        Self {
            id,
            block,
            context,
            receiver,
        }
    }

    /// Request identifier.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The requested block.
    pub fn block(&self) -> BlockPointer {
        self.block
    }

    /// The context the request was made with.
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Block the current thread until the outcome is delivered.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; use
    /// [`recv`](Self::recv) there instead.
    pub fn blocking_recv(self) -> RetrievalOutcome {
        let delivered = self.receiver.blocking_recv();
        Self::resolve(&self.context, delivered.ok())
    }

    /// Wait asynchronously for the outcome.
    pub async fn recv(self) -> RetrievalOutcome {
        let delivered = self.receiver.await;
        Self::resolve(&self.context, delivered.ok())
    }

    /// Take the outcome if it has already been delivered.
    ///
    /// Returns `None` while the retrieval is still pending and the caller's
    /// context is live.
    pub fn try_recv(&mut self) -> Option<RetrievalOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(Self::resolve(&self.context, Some(outcome))),
            Err(TryRecvError::Closed) => Some(Self::resolve(&self.context, None)),
            Err(TryRecvError::Empty) => self.context.err().map(Err),
        }
    }

    fn resolve(context: &RequestContext, delivered: Option<RetrievalOutcome>) -> RetrievalOutcome {
        if let Some(err) = context.err() {
            return Err(err);
        }
        delivered.unwrap_or(Err(RetrievalError::Abandoned))
    }
}

impl fmt::Debug for RetrievalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalHandle")
            .field("id", &self.id)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}
