//! Event counters and the Prometheus recorder
//!
//! `EventCounters` is constructed once by the process and handed to every
//! component that reports. Each call both emits through the `metrics`
//! facade (exported by whatever recorder is installed) and bumps an
//! in-process tally so behavior can be asserted without scraping.

use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::Result;

pub const EVENTS_PROCESSED: &str = "cdr_events_processed_total";
pub const EVENTS_FAILED: &str = "cdr_events_failed_total";
pub const EVENT_PROCESSING_SECONDS: &str = "cdr_event_processing_seconds";
pub const DISPATCH_IN_FLIGHT: &str = "cdr_dispatch_in_flight";
pub const DISPATCH_SATURATION: &str = "cdr_dispatch_saturation_ratio";
pub const BROKER_RECONNECTS: &str = "cdr_broker_reconnects_total";

pub const REASON_UNRECOGNIZED: &str = "unrecognized";
pub const REASON_RAW_LOG_WRITE_FAILED: &str = "raw_log_write_failed";
pub const REASON_DB_RECONCILE_FAILED: &str = "db_reconcile_failed";
pub const REASON_PANIC: &str = "panic";

/// Label used when the event type could not be read
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

const PROCESSING_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

#[derive(Debug, Default)]
pub struct EventCounters {
    processed: DashMap<String, u64>,
    failed: DashMap<(String, String), u64>,
}

impl EventCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self, event_type: &str) {
        metrics::counter!(EVENTS_PROCESSED, "event_type" => event_type.to_string()).increment(1);
        *self.processed.entry(event_type.to_string()).or_insert(0) += 1;
    }

    pub fn failed(&self, event_type: &str, reason: &'static str) {
        metrics::counter!(
            EVENTS_FAILED,
            "event_type" => event_type.to_string(),
            "reason" => reason
        )
        .increment(1);
        *self
            .failed
            .entry((event_type.to_string(), reason.to_string()))
            .or_insert(0) += 1;
    }

    pub fn processing_time(&self, event_type: &str, seconds: f64) {
        metrics::histogram!(EVENT_PROCESSING_SECONDS, "event_type" => event_type.to_string())
            .record(seconds);
    }

    pub fn dispatch_load(&self, in_flight: usize, worker_limit: usize) {
        metrics::gauge!(DISPATCH_IN_FLIGHT).set(in_flight as f64);
        if worker_limit > 0 {
            metrics::gauge!(DISPATCH_SATURATION).set(in_flight as f64 / worker_limit as f64);
        }
    }

    pub fn broker_reconnect(&self) {
        metrics::counter!(BROKER_RECONNECTS).increment(1);
    }

    pub fn processed_count(&self, event_type: &str) -> u64 {
        self.processed.get(event_type).map_or(0, |v| *v)
    }

    pub fn failed_count(&self, event_type: &str, reason: &str) -> u64 {
        self.failed
            .get(&(event_type.to_string(), reason.to_string()))
            .map_or(0, |v| *v)
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.iter().map(|e| *e.value()).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.iter().map(|e| *e.value()).sum()
    }
}

/// Install the global Prometheus recorder. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets(PROCESSING_BUCKETS)?
        .install_recorder()?;
    Ok(handle)
}
