//! Behavioral tests for the retrieval queue.
//!
//! Covers dispatch ordering, coalescing, preemption, result fan-out,
//! caller-local cancellation and shutdown. Workers are driven by hand so
//! each test controls exactly when entries leave the queue.

mod common;

use bytes::Bytes;
use common::{block, init_tracing};
use oxblock_retrieval::{FetchError, RequestContext, RetrievalError, RetrievalQueue};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

fn queue() -> RetrievalQueue {
    init_tracing();
    RetrievalQueue::new(1).unwrap()
}

/// A single request dispatches with its priority, order 0 and one request.
#[test]
fn test_basic_request_dispatch() {
    let q = queue();
    let ctx = RequestContext::background();
    let ptr1 = block("ptr1");

    let handle = q.request(&ctx, 1, ptr1).unwrap();
    let retrieval = q.work_on_request().recv().unwrap();

    assert_eq!(retrieval.block(), ptr1);
    assert_eq!(retrieval.heap_index(), None);
    assert_eq!(retrieval.priority(), 1);
    assert_eq!(retrieval.insertion_order(), 0);
    assert_eq!(retrieval.request_count(), 1);
    assert_eq!(retrieval.requests()[0].id(), handle.id());
    assert_eq!(q.pending_count(), 0);
}

/// A later higher-priority request is dispatched first.
#[test]
fn test_higher_priority_preempts() {
    let q = queue();
    let ctx = RequestContext::background();
    let ptr1 = block("ptr1");
    let ptr2 = block("ptr2");

    let _h1 = q.request(&ctx, 1, ptr1).unwrap();
    let _h2 = q.request(&ctx, 2, ptr2).unwrap();

    let first = q.work_on_request().recv().unwrap();
    assert_eq!(first.block(), ptr2);
    assert_eq!(first.priority(), 2);
    assert_eq!(first.insertion_order(), 1);

    let second = q.work_on_request().recv().unwrap();
    assert_eq!(second.block(), ptr1);
    assert_eq!(second.priority(), 1);
    assert_eq!(second.insertion_order(), 0);
}

/// Two requests for one block share one entry and one result.
#[test]
fn test_coalesced_requests_share_result() {
    let q = queue();
    let ctx = RequestContext::background();
    let ptr1 = block("ptr1");

    let h1 = q.request(&ctx, 1, ptr1).unwrap();
    let h2 = q.request(&ctx, 3, ptr1).unwrap();
    assert_eq!(q.pending_count(), 1);

    let retrieval = q.work_on_request().recv().unwrap();
    assert_eq!(retrieval.priority(), 3);
    assert_eq!(retrieval.insertion_order(), 0);
    assert_eq!(retrieval.request_count(), 2);

    let report = q.finalize(retrieval, Ok(Bytes::from_static(b"contents")));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.dropped, 0);

    assert_eq!(h1.blocking_recv().unwrap(), Bytes::from_static(b"contents"));
    assert_eq!(h2.blocking_recv().unwrap(), Bytes::from_static(b"contents"));
}

/// Raising a pending entry's priority moves it ahead of earlier entries.
#[test]
fn test_priority_raise_overtakes_earlier_entries() {
    let q = queue();
    let ctx = RequestContext::background();
    let (a, b, c) = (block("a"), block("b"), block("c"));

    let _ha = q.request(&ctx, 2, a).unwrap();
    let _hb = q.request(&ctx, 2, b).unwrap();
    let _hc = q.request(&ctx, 1, c).unwrap();
    let _hc2 = q.request(&ctx, 2, c).unwrap();
    let _hc3 = q.request(&ctx, 5, c).unwrap();

    let order: Vec<_> = (0..3)
        .map(|_| q.next_retrieval().unwrap().block())
        .collect();
    assert_eq!(order, vec![c, a, b]);
    assert_eq!(q.stats().preemptions.load(Ordering::Relaxed), 2);
}

/// Equal priorities dispatch in arrival order.
#[test]
fn test_equal_priority_is_fifo() {
    let q = queue();
    let ctx = RequestContext::background();
    let blocks: Vec<_> = (0..10).map(|i| block(&format!("b{i}"))).collect();
    let _handles: Vec<_> = blocks
        .iter()
        .map(|b| q.request(&ctx, 7, *b).unwrap())
        .collect();

    let dispatched: Vec<_> = (0..blocks.len())
        .map(|_| q.next_retrieval().unwrap().block())
        .collect();
    assert_eq!(dispatched, blocks);
}

/// Once dispatched, an entry can't be joined; a new request starts over.
#[test]
fn test_request_after_dispatch_creates_new_entry() {
    let q = queue();
    let ctx = RequestContext::background();
    let ptr = block("ptr");

    let h1 = q.request(&ctx, 1, ptr).unwrap();
    let in_flight = q.next_retrieval().unwrap();
    assert!(!q.is_pending(&ptr));

    let h2 = q.request(&ctx, 9, ptr).unwrap();
    assert!(q.is_pending(&ptr));
    assert_eq!(in_flight.request_count(), 1);
    assert_eq!(in_flight.priority(), 1);

    let fresh = q.next_retrieval().unwrap();
    assert_eq!(fresh.insertion_order(), 1);
    assert_eq!(fresh.priority(), 9);
    assert_eq!(fresh.request_count(), 1);

    q.finalize(in_flight, Ok(Bytes::from_static(b"one")));
    q.finalize(fresh, Ok(Bytes::from_static(b"two")));
    assert_eq!(h1.blocking_recv().unwrap(), Bytes::from_static(b"one"));
    assert_eq!(h2.blocking_recv().unwrap(), Bytes::from_static(b"two"));
}

/// Joining requests still consume an insertion order.
#[test]
fn test_insertion_order_increments_on_join() {
    let q = queue();
    let ctx = RequestContext::background();

    let _h0 = q.request(&ctx, 1, block("a")).unwrap();
    let h1 = q.request(&ctx, 1, block("a")).unwrap();
    let _h2 = q.request(&ctx, 1, block("b")).unwrap();
    assert_eq!(h1.id().raw(), 1);

    let _a = q.next_retrieval().unwrap();
    let b = q.next_retrieval().unwrap();
    assert_eq!(b.insertion_order(), 2);
}

/// A canceled context is rejected without touching the queue.
#[test]
fn test_canceled_context_rejected() {
    let q = queue();
    let canceled = RequestContext::background();
    canceled.cancel();

    let err = q.request(&canceled, 1, block("a")).unwrap_err();
    assert!(matches!(err, RetrievalError::Canceled));
    assert_eq!(q.pending_count(), 0);

    // The rejected call did not consume an insertion order
    let handle = q.request(&RequestContext::background(), 1, block("a")).unwrap();
    assert_eq!(handle.id().raw(), 0);
    assert_eq!(q.stats().rejected.load(Ordering::Relaxed), 1);
}

/// An expired context is rejected with a deadline error.
#[test]
fn test_expired_context_rejected() {
    let q = queue();
    let expired = RequestContext::with_deadline(Instant::now() - Duration::from_millis(1));

    let err = q.request(&expired, 1, block("a")).unwrap_err();
    assert!(matches!(err, RetrievalError::DeadlineExceeded));
    assert_eq!(q.pending_count(), 0);
}

/// A fetch failure reaches every coalesced caller unchanged.
#[test]
fn test_fetch_failure_fans_out() {
    let q = queue();
    let ctx = RequestContext::background();
    let ptr = block("ptr");

    let h1 = q.request(&ctx, 1, ptr).unwrap();
    let h2 = q.request(&ctx, 2, ptr).unwrap();

    let retrieval = q.next_retrieval().unwrap();
    q.finalize(retrieval, Err(FetchError::msg("disk on fire")));

    for handle in [h1, h2] {
        match handle.blocking_recv() {
            Err(RetrievalError::Fetch(e)) => assert_eq!(e.to_string(), "disk on fire"),
            other => panic!("expected fetch error, got {other:?}"),
        }
    }
    assert_eq!(q.stats().fetch_failures.load(Ordering::Relaxed), 1);
}

/// Canceling one caller neither removes the entry nor affects other callers.
#[test]
fn test_cancellation_is_caller_local() {
    let q = queue();
    let ptr = block("ptr");
    let impatient = RequestContext::background();
    let patient = RequestContext::background();

    let h1 = q.request(&impatient, 1, ptr).unwrap();
    let h2 = q.request(&patient, 1, ptr).unwrap();
    impatient.cancel();
    assert!(q.is_pending(&ptr));

    let retrieval = q.next_retrieval().unwrap();
    assert_eq!(retrieval.request_count(), 2);
    assert!(!retrieval.is_abandoned());
    let report = q.finalize(retrieval, Ok(Bytes::from_static(b"data")));
    assert_eq!(report.delivered, 2);

    assert!(matches!(h1.blocking_recv(), Err(RetrievalError::Canceled)));
    assert_eq!(h2.blocking_recv().unwrap(), Bytes::from_static(b"data"));
}

/// A waiting consumer is woken by a later request.
#[test]
fn test_blocked_consumer_wakes_on_request() {
    let q = Arc::new(queue());
    let consumer = {
        let q = Arc::clone(&q);
        thread::spawn(move || q.next_retrieval().map(|r| r.block()))
    };

    while q.waiting_workers() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    let _handle = q.request(&RequestContext::background(), 1, block("late")).unwrap();

    assert_eq!(consumer.join().unwrap().unwrap(), block("late"));
}

/// Concurrent consumers receive distinct entries.
#[test]
fn test_concurrent_consumers_get_distinct_entries() {
    let q = Arc::new(queue());
    let ctx = RequestContext::background();
    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let q = Arc::clone(&q);
            thread::spawn(move || q.next_retrieval().map(|r| r.block()))
        })
        .collect();

    let blocks: Vec<_> = (0..4).map(|i| block(&format!("b{i}"))).collect();
    let _handles: Vec<_> = blocks
        .iter()
        .map(|b| q.request(&ctx, 1, *b).unwrap())
        .collect();

    let mut received: Vec<_> = consumers
        .into_iter()
        .map(|c| c.join().unwrap().unwrap())
        .collect();
    received.sort();
    let mut expected = blocks;
    expected.sort();
    assert_eq!(received, expected);
    assert_eq!(q.pending_count(), 0);
}

/// The pop happens when a consumer is ready, not when it registered interest.
#[test]
fn test_registered_consumer_gets_current_best() {
    let q = queue();
    let ctx = RequestContext::background();

    let _h1 = q.request(&ctx, 1, block("low")).unwrap();
    let _h2 = q.request(&ctx, 5, block("high")).unwrap();

    let receiver = q.work_on_request();
    assert_eq!(receiver.recv().unwrap().block(), block("high"));
    assert_eq!(q.pending_count(), 1);
}

/// A consumer that walks away does not lose the entry it would have received.
#[test]
fn test_abandoned_consumer_does_not_lose_entry() {
    let q = queue();
    drop(q.work_on_request());

    let _handle = q.request(&RequestContext::background(), 1, block("a")).unwrap();
    assert_eq!(q.pending_count(), 1);

    let retrieval = q.next_retrieval().unwrap();
    assert_eq!(retrieval.block(), block("a"));
    assert_eq!(retrieval.insertion_order(), 0);
}

/// An entry handed to a consumer that never receives it goes back to the
/// queue and is still fetched for its caller.
#[test]
fn test_unreceived_entry_is_requeued() {
    let q = queue();
    let ctx = RequestContext::background();
    let receiver = q.work_on_request();
    let handle = q.request(&ctx, 1, block("a")).unwrap();
    assert_eq!(q.pending_count(), 0);
    assert!(!q.is_pending(&block("a")));

    drop(receiver);
    assert_eq!(q.pending_count(), 1);
    assert!(q.is_pending(&block("a")));
    assert_eq!(q.waiting_workers(), 0);

    let retrieval = q.next_retrieval().unwrap();
    assert_eq!(retrieval.block(), block("a"));
    assert_eq!(retrieval.insertion_order(), 0);
    q.finalize(retrieval, Ok(Bytes::from_static(b"contents")));
    assert_eq!(handle.blocking_recv().unwrap(), Bytes::from_static(b"contents"));
}

/// A requeued entry goes to the next consumer already waiting.
#[test]
fn test_unreceived_entry_passes_to_waiting_consumer() {
    let q = Arc::new(queue());
    let ctx = RequestContext::background();
    let first = q.work_on_request();
    let handle = q.request(&ctx, 1, block("a")).unwrap();

    let consumer = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            let retrieval = q.next_retrieval().unwrap();
            q.finalize(retrieval, Ok(Bytes::from_static(b"a")));
        })
    };
    while q.waiting_workers() == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    drop(first);
    consumer.join().unwrap();
    assert_eq!(handle.blocking_recv().unwrap(), Bytes::from_static(b"a"));
    assert_eq!(q.waiting_workers(), 0);
}

/// Dropped registrations on an idle queue do not pile up.
#[test]
fn test_dropped_consumers_do_not_accumulate() {
    let q = queue();
    for _ in 0..1_000 {
        drop(q.work_on_request());
    }
    assert_eq!(q.waiting_workers(), 0);

    let _handle = q.request(&RequestContext::background(), 1, block("a")).unwrap();
    assert_eq!(q.pending_count(), 1);
    assert_eq!(q.stats().handoffs_failed.load(Ordering::Relaxed), 0);
}

/// Timing out leaves nothing registered and nothing lost.
#[test]
fn test_next_retrieval_timeout() {
    let q = queue();
    let started = Instant::now();
    assert!(q.next_retrieval_timeout(Duration::from_millis(20)).unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(q.waiting_workers(), 0);

    let _handle = q.request(&RequestContext::background(), 1, block("a")).unwrap();
    let retrieval = q.next_retrieval_timeout(Duration::from_millis(20)).unwrap();
    assert_eq!(retrieval.map(|r| r.block()), Some(block("a")));
}

/// Shutdown wakes consumers and rejects new requests; in-flight work still completes.
#[test]
fn test_shutdown() {
    let q = Arc::new(queue());
    let ctx = RequestContext::background();

    let handle = q.request(&ctx, 2, block("in-flight")).unwrap();
    let in_flight = q.next_retrieval().unwrap();

    let consumer = {
        let q = Arc::clone(&q);
        thread::spawn(move || q.next_retrieval().map(|r| r.block()))
    };
    while q.waiting_workers() == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    q.shutdown();

    assert!(matches!(consumer.join().unwrap(), Err(RetrievalError::Shutdown)));
    assert!(matches!(
        q.request(&ctx, 1, block("late")),
        Err(RetrievalError::Shutdown)
    ));
    assert!(matches!(q.next_retrieval(), Err(RetrievalError::Shutdown)));
    assert!(matches!(
        q.next_retrieval_timeout(Duration::from_millis(5)),
        Err(RetrievalError::Shutdown)
    ));

    q.finalize(in_flight, Ok(Bytes::from_static(b"done")));
    assert_eq!(handle.blocking_recv().unwrap(), Bytes::from_static(b"done"));
}

/// Entries still queued at shutdown fail with a shutdown error.
#[test]
fn test_shutdown_fails_pending_entries() {
    let q = queue();
    let ctx = RequestContext::background();
    let h1 = q.request(&ctx, 1, block("a")).unwrap();
    let h2 = q.request(&ctx, 1, block("a")).unwrap();
    let h3 = q.request(&ctx, 1, block("b")).unwrap();

    q.shutdown();
    assert_eq!(q.pending_count(), 0);
    for handle in [h1, h2, h3] {
        assert!(matches!(handle.blocking_recv(), Err(RetrievalError::Shutdown)));
    }
}

/// A worker that drops its retrieval leaves callers with a clear error.
#[test]
fn test_dropped_retrieval_reports_abandoned() {
    let q = queue();
    let handle = q.request(&RequestContext::background(), 1, block("a")).unwrap();
    drop(q.next_retrieval().unwrap());

    assert!(matches!(handle.blocking_recv(), Err(RetrievalError::Abandoned)));
}

/// Results can be awaited from async code.
#[tokio::test]
async fn test_async_recv() {
    let q = Arc::new(queue());
    let handle = q.request(&RequestContext::background(), 1, block("a")).unwrap();

    let worker = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            let retrieval = q.next_retrieval().unwrap();
            q.finalize(retrieval, Ok(Bytes::from_static(b"async")));
        })
    };

    let contents = tokio::time::timeout(Duration::from_secs(5), handle.recv())
        .await
        .expect("result not delivered")
        .unwrap();
    assert_eq!(contents, Bytes::from_static(b"async"));
    worker.join().unwrap();
}

/// Stats track accepted, coalesced and delivered work.
#[test]
fn test_stats_snapshot() {
    let q = queue();
    let ctx = RequestContext::background();
    let _h1 = q.request(&ctx, 1, block("a")).unwrap();
    let _h2 = q.request(&ctx, 2, block("a")).unwrap();
    let _h3 = q.request(&ctx, 1, block("b")).unwrap();

    let a = q.next_retrieval().unwrap();
    q.finalize(a, Ok(Bytes::new()));

    let snap = q.stats().snapshot();
    assert_eq!(snap.requests, 3);
    assert_eq!(snap.created, 2);
    assert_eq!(snap.coalesced, 1);
    assert_eq!(snap.preemptions, 1);
    assert_eq!(snap.dispatched, 1);
    assert_eq!(snap.finalized, 1);
    assert_eq!(snap.deliveries, 2);
    assert_eq!(snap.outstanding(), 1);
}
