//! Dispatch Loop Tests
//!
//! Tests for:
//! - Acknowledgment mapping for each processing outcome
//! - Panic isolation (requeue, loop keeps running)
//! - Semaphore backpressure on intake
//! - Shutdown: intake stops, in-flight work finishes within the grace period

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use cdr_common::AckAction;
use cdr_queue::{Acknowledger, InboundMessage, QueueError};
use cdr_router::{DispatchExit, Dispatcher, EventCounters, EventProcessor, MessageHandler, ReconcilePolicy};
use cdr_store::MemoryCallStore;

type Settled = Arc<Mutex<Vec<(u64, AckAction)>>>;

/// Records how each delivery was settled
struct MockAcker {
    delivery_tag: u64,
    settled: Settled,
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<(), String> {
        self.settled.lock().push((self.delivery_tag, AckAction::Ack));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), String> {
        let action = if requeue {
            AckAction::NackRequeue
        } else {
            AckAction::NackDiscard
        };
        self.settled.lock().push((self.delivery_tag, action));
        Ok(())
    }
}

fn delivery(tag: u64, body: &[u8], settled: &Settled) -> Result<InboundMessage, QueueError> {
    Ok(InboundMessage::new(
        tag,
        false,
        "call.events",
        body.to_vec(),
        Box::new(MockAcker {
            delivery_tag: tag,
            settled: settled.clone(),
        }),
    ))
}

fn settled_action(settled: &Settled, tag: u64) -> Option<AckAction> {
    settled
        .lock()
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, action)| *action)
}

/// Panics on `panic`, blocks on `block` until released, acks anything else
struct ScriptedHandler {
    running: AtomicUsize,
    max_running: AtomicUsize,
    release: Notify,
}

impl ScriptedHandler {
    fn new() -> Self {
        Self {
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, body: &[u8]) -> AckAction {
        if body == b"panic" {
            panic!("handler blew up");
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if body == b"block" {
            self.release.notified().await;
        } else {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        AckAction::Ack
    }
}

#[tokio::test]
async fn test_outcomes_map_to_acknowledgments() {
    let store = Arc::new(MemoryCallStore::new());
    let counters = Arc::new(EventCounters::new());
    let processor = Arc::new(EventProcessor::new(
        store.clone(),
        ReconcilePolicy::default(),
        counters.clone(),
    ));
    let dispatcher = Dispatcher::new(processor, counters.clone(), 4);
    let settled: Settled = Arc::new(Mutex::new(Vec::new()));

    let deliveries = stream::iter(vec![
        delivery(
            1,
            br#"{"eventType":"call.started","callId":"c-1","timestamp":"2024-05-01T10:00:00Z"}"#,
            &settled,
        ),
        delivery(2, b"garbage", &settled),
        delivery(3, br#"{"eventType":"agent.joined"}"#, &settled),
    ]);

    let cancel = CancellationToken::new();
    let exit = dispatcher.run("cdr", deliveries, &cancel).await;
    assert!(matches!(exit, DispatchExit::StreamClosed));
    assert!(dispatcher.tracker().wait_idle(Duration::from_secs(5)).await);

    assert_eq!(settled_action(&settled, 1), Some(AckAction::Ack));
    assert_eq!(settled_action(&settled, 2), Some(AckAction::NackDiscard));
    assert_eq!(settled_action(&settled, 3), Some(AckAction::Ack));
    assert_eq!(counters.failed_count("unknown", "unrecognized"), 1);
    assert_eq!(counters.total_processed(), 2);
}

#[tokio::test]
async fn test_storage_outage_requeues() {
    let store = Arc::new(MemoryCallStore::new());
    store.set_fail_raw_events(true);
    let counters = Arc::new(EventCounters::new());
    let processor = Arc::new(EventProcessor::new(
        store,
        ReconcilePolicy::default(),
        counters.clone(),
    ));
    let dispatcher = Dispatcher::new(processor, counters.clone(), 2);
    let settled: Settled = Arc::new(Mutex::new(Vec::new()));

    let deliveries = stream::iter(vec![delivery(
        9,
        br#"{"eventType":"call.ended","callId":"c-9","timestamp":"2024-05-01T10:00:00Z"}"#,
        &settled,
    )]);

    dispatcher
        .run("cdr", deliveries, &CancellationToken::new())
        .await;
    assert!(dispatcher.tracker().wait_idle(Duration::from_secs(5)).await);

    assert_eq!(settled_action(&settled, 9), Some(AckAction::NackRequeue));
    assert_eq!(counters.failed_count("call.ended", "raw_log_write_failed"), 1);
}

#[tokio::test]
async fn test_panic_requeues_and_loop_survives() {
    let handler = Arc::new(ScriptedHandler::new());
    let counters = Arc::new(EventCounters::new());
    let dispatcher = Dispatcher::new(handler, counters.clone(), 2);
    let settled: Settled = Arc::new(Mutex::new(Vec::new()));

    let deliveries = stream::iter(vec![
        delivery(1, b"panic", &settled),
        delivery(2, b"ok", &settled),
        delivery(3, b"panic", &settled),
        delivery(4, b"ok", &settled),
    ]);

    let exit = dispatcher
        .run("cdr", deliveries, &CancellationToken::new())
        .await;
    assert!(matches!(exit, DispatchExit::StreamClosed));
    assert!(dispatcher.tracker().wait_idle(Duration::from_secs(5)).await);

    assert_eq!(settled_action(&settled, 1), Some(AckAction::NackRequeue));
    assert_eq!(settled_action(&settled, 2), Some(AckAction::Ack));
    assert_eq!(settled_action(&settled, 3), Some(AckAction::NackRequeue));
    assert_eq!(settled_action(&settled, 4), Some(AckAction::Ack));
    assert_eq!(counters.failed_count("unknown", "panic"), 2);
    // Slots were returned despite the panics
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn test_concurrency_bounded_by_worker_limit() {
    let handler = Arc::new(ScriptedHandler::new());
    let counters = Arc::new(EventCounters::new());
    let dispatcher = Dispatcher::new(handler.clone(), counters, 3);
    let settled: Settled = Arc::new(Mutex::new(Vec::new()));

    let deliveries = stream::iter((0..30).map(|tag| delivery(tag, b"ok", &settled)).collect::<Vec<_>>());

    dispatcher
        .run("cdr", deliveries, &CancellationToken::new())
        .await;
    assert!(dispatcher.tracker().wait_idle(Duration::from_secs(5)).await);

    assert_eq!(settled.lock().len(), 30);
    let peak = handler.max_running.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 3, "peak concurrency was {peak}");
}

#[tokio::test]
async fn test_saturated_pool_stalls_intake() {
    let handler = Arc::new(ScriptedHandler::new());
    let counters = Arc::new(EventCounters::new());
    let dispatcher = Arc::new(Dispatcher::new(handler.clone(), counters, 2));
    let settled: Settled = Arc::new(Mutex::new(Vec::new()));
    let pulled = Arc::new(AtomicUsize::new(0));

    let deliveries = {
        let pulled = pulled.clone();
        stream::iter((0..5).map(|tag| delivery(tag, b"block", &settled)).collect::<Vec<_>>())
            .inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            })
            .boxed()
    };

    let cancel = CancellationToken::new();
    let run = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run("cdr", deliveries, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pulled.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.in_flight(), 2);
    assert!(settled.lock().is_empty());

    cancel.cancel();
    let exit = run.await.unwrap();
    assert!(matches!(exit, DispatchExit::Shutdown));

    // In-flight work is allowed to finish after intake stops
    handler.release.notify_waiters();
    assert!(dispatcher.tracker().wait_idle(Duration::from_secs(5)).await);
    assert_eq!(settled.lock().len(), 2);
    assert_eq!(pulled.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_grace_expires_on_stuck_worker() {
    let handler = Arc::new(ScriptedHandler::new());
    let counters = Arc::new(EventCounters::new());
    let dispatcher = Arc::new(Dispatcher::new(handler.clone(), counters, 2));
    let settled: Settled = Arc::new(Mutex::new(Vec::new()));

    let deliveries = stream::iter(vec![delivery(1, b"block", &settled)])
        .chain(stream::pending())
        .boxed();

    let cancel = CancellationToken::new();
    let run = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run("cdr", deliveries, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    assert!(matches!(run.await.unwrap(), DispatchExit::Shutdown));

    assert!(!dispatcher.tracker().wait_idle(Duration::from_millis(100)).await);
    assert_eq!(dispatcher.tracker().count(), 1);
    assert!(settled.lock().is_empty());
}

#[tokio::test]
async fn test_stream_error_ends_loop() {
    let handler = Arc::new(ScriptedHandler::new());
    let dispatcher = Dispatcher::new(handler, Arc::new(EventCounters::new()), 2);

    let deliveries = stream::iter(vec![Err(QueueError::Ack {
        action: "ack",
        delivery_tag: 0,
        reason: "channel closed".to_string(),
    })]);

    let exit = dispatcher
        .run("cdr", deliveries, &CancellationToken::new())
        .await;
    assert!(matches!(exit, DispatchExit::StreamError(_)));
}
