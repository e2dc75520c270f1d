//! Error types for block retrieval.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors a caller can observe for a block request.
///
/// Cloneable so a single fetch outcome can be fanned out to every request
/// coalesced onto the same retrieval.
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    /// The caller's context was canceled.
    #[error("request canceled")]
    Canceled,

    /// The caller's context deadline passed.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The block fetch failed. The fetcher's error is forwarded unchanged.
    #[error("block fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The retrieval queue has been shut down.
    #[error("retrieval queue shut down")]
    Shutdown,

    /// The retrieval was dropped before a result was delivered.
    #[error("retrieval abandoned before completion")]
    Abandoned,
}

impl RetrievalError {
    /// Whether this error came from the caller's own context.
    pub fn is_context_error(&self) -> bool {
        matches!(self, RetrievalError::Canceled | RetrievalError::DeadlineExceeded)
    }
}

/// Opaque error returned by a block fetcher.
#[derive(Clone)]
pub struct FetchError(Arc<dyn StdError + Send + Sync + 'static>);

impl FetchError {
    /// Wrap an arbitrary fetcher error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Create a fetch error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(io::Error::other(message.into()))
    }

    /// The wrapped error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.0).finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<io::Error> for FetchError {
    fn from(e: io::Error) -> Self {
        Self::new(e)
    }
}

/// Invalid retrieval configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// At least one worker is required to drain the queue.
    #[error("worker count must be at least 1")]
    NoWorkers,
}
