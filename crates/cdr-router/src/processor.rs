//! Per-message processing
//!
//! Route, audit, reconcile, decide. Every attempt ends in exactly one of
//! the processed or failed counters.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cdr_common::{AckAction, RawEvent};
use cdr_store::CallStore;
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::classify::route;
use crate::metrics::{
    EventCounters, REASON_DB_RECONCILE_FAILED, REASON_RAW_LOG_WRITE_FAILED, REASON_UNRECOGNIZED,
    UNKNOWN_EVENT_TYPE,
};
use crate::reconcile::{Reconciled, Reconciler, ReconcilePolicy};
use crate::schema::DecodedEvent;

/// Turns one delivery body into an acknowledgment decision
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> AckAction;
}

pub struct EventProcessor {
    store: Arc<dyn CallStore>,
    reconciler: Reconciler,
    counters: Arc<EventCounters>,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn CallStore>,
        policy: ReconcilePolicy,
        counters: Arc<EventCounters>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone(), policy),
            store,
            counters,
        }
    }

    fn raw_event(event: &DecodedEvent, body: &[u8]) -> RawEvent {
        RawEvent {
            call_id: event.call_id().map(str::to_string),
            event_type: event.event_type().to_string(),
            event_timestamp: event.timestamp().unwrap_or_else(Utc::now),
            payload: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

#[async_trait]
impl MessageHandler for EventProcessor {
    async fn handle(&self, body: &[u8]) -> AckAction {
        let started = Instant::now();

        let event = match route(body) {
            Ok(event) => event,
            Err(unrecognized) => {
                warn!(
                    reason = %unrecognized.reason,
                    body_len = body.len(),
                    "Unrecognized message, dead-lettering"
                );
                self.counters.failed(UNKNOWN_EVENT_TYPE, REASON_UNRECOGNIZED);
                return AckAction::NackDiscard;
            }
        };

        let event_type = event.event_type();
        let call_id = event.call_id().unwrap_or("");
        let trace_id = event.trace_id().unwrap_or("");
        debug!(event_type, call_id, trace_id, "Event received");

        if let Err(e) = self.store.append_raw_event(&Self::raw_event(&event, body)).await {
            error!(
                event_type,
                call_id,
                trace_id,
                error = %e,
                "Failed to write raw event, requeuing"
            );
            self.counters.failed(event_type, REASON_RAW_LOG_WRITE_FAILED);
            return AckAction::NackRequeue;
        }

        let action = match self.reconciler.apply(&event).await {
            Ok(outcome) => {
                if let Reconciled::Skipped(why) = outcome {
                    debug!(event_type, call_id, skipped = why, "Event acknowledged without change");
                }
                self.counters.processed(event_type);
                AckAction::Ack
            }
            Err(e) => {
                error!(
                    event_type,
                    call_id,
                    trace_id,
                    error = %e,
                    "Failed to reconcile call record, requeuing"
                );
                self.counters.failed(event_type, REASON_DB_RECONCILE_FAILED);
                AckAction::NackRequeue
            }
        };

        self.counters
            .processing_time(event_type, started.elapsed().as_secs_f64());
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdr_common::CallStatus;
    use cdr_store::MemoryCallStore;

    fn processor(store: Arc<MemoryCallStore>) -> (EventProcessor, Arc<EventCounters>) {
        let counters = Arc::new(EventCounters::new());
        (
            EventProcessor::new(store, ReconcilePolicy::default(), counters.clone()),
            counters,
        )
    }

    #[tokio::test]
    async fn test_started_event_is_audited_and_reconciled() {
        let store = Arc::new(MemoryCallStore::new());
        let (processor, counters) = processor(store.clone());

        let body = br#"{"eventType":"call.started","callId":"c-1","timestamp":"2024-05-01T10:00:00Z"}"#;
        assert_eq!(processor.handle(body).await, AckAction::Ack);

        let raw = store.raw_events();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].call_id.as_deref(), Some("c-1"));
        assert_eq!(raw[0].event_type, "call.started");
        assert_eq!(raw[0].payload.as_bytes(), body);

        let record = tokio_test::assert_ok!(store.get("c-1").await).unwrap();
        assert_eq!(record.status, CallStatus::Started);
        assert_eq!(counters.processed_count("call.started"), 1);
    }

    #[tokio::test]
    async fn test_generic_event_only_audited() {
        let store = Arc::new(MemoryCallStore::new());
        let (processor, counters) = processor(store.clone());

        let body = br#"{"eventType":"agent.joined","payload":{"x":1}}"#;
        assert_eq!(processor.handle(body).await, AckAction::Ack);
        assert_eq!(store.raw_events().len(), 1);
        assert_eq!(store.raw_events()[0].call_id, None);
        assert_eq!(store.call_count(), 0);
        assert_eq!(counters.processed_count("agent.joined"), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_discarded_and_counted() {
        let store = Arc::new(MemoryCallStore::new());
        let (processor, counters) = processor(store.clone());

        assert_eq!(processor.handle(b"\x00\x01garbage").await, AckAction::NackDiscard);
        assert_eq!(counters.failed_count("unknown", "unrecognized"), 1);
        assert_eq!(counters.total_processed(), 0);
        assert!(store.raw_events().is_empty());
    }

    #[tokio::test]
    async fn test_raw_log_failure_requeues_without_reconciling() {
        let store = Arc::new(MemoryCallStore::new());
        store.set_fail_raw_events(true);
        let (processor, counters) = processor(store.clone());

        let body = br#"{"eventType":"call.started","callId":"c-1","timestamp":"2024-05-01T10:00:00Z"}"#;
        assert_eq!(processor.handle(body).await, AckAction::NackRequeue);
        assert_eq!(counters.failed_count("call.started", "raw_log_write_failed"), 1);
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_failure_requeues() {
        let store = Arc::new(MemoryCallStore::new());
        store.set_fail_calls(true);
        let (processor, counters) = processor(store.clone());

        let body = br#"{"eventType":"call.ended","callId":"c-1","timestamp":"2024-05-01T10:00:40Z"}"#;
        assert_eq!(processor.handle(body).await, AckAction::NackRequeue);
        assert_eq!(counters.failed_count("call.ended", "db_reconcile_failed"), 1);
        assert_eq!(store.raw_events().len(), 1);
    }

    #[tokio::test]
    async fn test_identification_without_user_is_acked_noop() {
        let store = Arc::new(MemoryCallStore::new());
        let (processor, counters) = processor(store.clone());

        let body = br#"{"eventType":"user.identified.for_call","callId":"c-1"}"#;
        assert_eq!(processor.handle(body).await, AckAction::Ack);
        assert_eq!(store.call_count(), 0);
        assert_eq!(counters.processed_count("user.identified.for_call"), 1);
    }
}
