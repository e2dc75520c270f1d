//! Per-caller request contexts.
//!
//! A [`RequestContext`] carries a cancellation flag and an optional
//! deadline. Cancellation is caller-local: canceling one context never
//! removes a shared retrieval from the queue, it only changes what that
//! caller's [`RetrievalHandle`](crate::RetrievalHandle) reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RetrievalConfig;
use crate::error::RetrievalError;

#[derive(Debug, Default)]
struct ContextState {
    canceled: AtomicBool,
    deadline: Option<Instant>,
}

/// Cancellable execution context for one block request.
///
/// Clones share the same cancellation state.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    state: Arc<ContextState>,
}

impl RequestContext {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            state: Arc::new(ContextState {
                canceled: AtomicBool::new(false),
                deadline: Some(deadline),
            }),
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context using the configured default request timeout, if any.
    pub fn for_config(config: &RetrievalConfig) -> Self {
        match config.default_request_timeout {
            Some(timeout) => Self::with_timeout(timeout),
            None => Self::background(),
        }
    }

    /// Cancel the context. Idempotent.
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.state.deadline
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.state
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Whether the context is done, either canceled or expired.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason the context is done, or `None` while it is still live.
    ///
    /// Cancellation takes precedence over expiry.
    pub fn err(&self) -> Option<RetrievalError> {
        if self.is_canceled() {
            Some(RetrievalError::Canceled)
        } else if self.is_expired() {
            Some(RetrievalError::DeadlineExceeded)
        } else {
            None
        }
    }
}
