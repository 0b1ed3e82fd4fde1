//! In-memory call store
//!
//! Mirrors the PostgreSQL UPSERT semantics statement for statement, with
//! one lock held per operation standing in for row-level atomicity. Failure
//! switches let tests simulate an unavailable database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cdr_common::{
    clamped_duration_seconds, CallRecord, CallStatus, CompletedCall, Disposition,
    IdentityUpdate, LifecycleSnapshot, RawEvent,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{CallStore, Result, StoreError};

#[derive(Default)]
pub struct MemoryCallStore {
    calls: Mutex<HashMap<String, CallRecord>>,
    events: Mutex<Vec<RawEvent>>,
    fail_raw_events: AtomicBool,
    fail_calls: AtomicBool,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `append_raw_event` fail until switched back off.
    pub fn set_fail_raw_events(&self, fail: bool) {
        self.fail_raw_events.store(fail, Ordering::SeqCst);
    }

    /// Make every `calls` read or write fail until switched back off.
    pub fn set_fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    pub fn raw_events(&self) -> Vec<RawEvent> {
        self.events.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn check_calls(&self, operation: &'static str, call_id: &str) -> Result<()> {
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(StoreError::query(operation, Some(call_id), "database unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn append_raw_event(&self, event: &RawEvent) -> Result<()> {
        if self.fail_raw_events.load(Ordering::SeqCst) {
            return Err(StoreError::query(
                "append_raw_event",
                event.call_id.as_deref(),
                "database unavailable",
            ));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn upsert_started(&self, call_id: &str, start_time: DateTime<Utc>) -> Result<()> {
        self.check_calls("upsert_started", call_id)?;
        let now = Utc::now();
        let mut calls = self.calls.lock();

        match calls.get_mut(call_id) {
            None => {
                let mut record = CallRecord::placeholder(call_id, CallStatus::Started, now);
                record.start_time = Some(start_time);
                calls.insert(call_id.to_string(), record);
            }
            Some(record) => {
                let backfill = record.status.is_completed()
                    && record.duration_seconds.is_none()
                    && record.answer_time.is_none()
                    && record.start_time.is_none();
                if backfill {
                    if let Some(end_time) = record.end_time {
                        record.duration_seconds =
                            Some(clamped_duration_seconds(start_time, end_time));
                    }
                }
                record.start_time = record.start_time.or(Some(start_time));
                record.updated_at = now;
            }
        }
        Ok(())
    }

    async fn upsert_answered(&self, call_id: &str, answer_time: DateTime<Utc>) -> Result<bool> {
        self.check_calls("upsert_answered", call_id)?;
        let now = Utc::now();
        let mut calls = self.calls.lock();

        match calls.get_mut(call_id) {
            None => {
                let mut record = CallRecord::placeholder(call_id, CallStatus::Started, now);
                record.answer_time = Some(answer_time);
                record.disposition = Some(Disposition::Answered);
                calls.insert(call_id.to_string(), record);
                Ok(true)
            }
            Some(record) if record.status.is_completed() => Ok(false),
            Some(record) => {
                record.answer_time = record.answer_time.or(Some(answer_time));
                record.disposition = Some(Disposition::Answered);
                record.updated_at = now;
                Ok(true)
            }
        }
    }

    async fn lifecycle_snapshot(&self, call_id: &str) -> Result<Option<LifecycleSnapshot>> {
        self.check_calls("lifecycle_snapshot", call_id)?;
        Ok(self.calls.lock().get(call_id).map(CallRecord::lifecycle))
    }

    async fn upsert_ended(&self, call_id: &str, completed: &CompletedCall) -> Result<bool> {
        self.check_calls("upsert_ended", call_id)?;
        let now = Utc::now();
        let mut calls = self.calls.lock();

        match calls.get_mut(call_id) {
            None => {
                let mut record = CallRecord::placeholder(call_id, CallStatus::Completed, now);
                record.end_time = Some(completed.end_time);
                record.duration_seconds = completed.duration_seconds;
                record.disposition = Some(completed.disposition);
                calls.insert(call_id.to_string(), record);
                Ok(true)
            }
            Some(record) if record.status.is_completed() => Ok(false),
            Some(record) => {
                // An answer committed after the caller's snapshot still wins
                let answered = record.answer_time.is_some()
                    || record.disposition == Some(Disposition::Answered);
                let duration = match record.answer_time {
                    Some(answer) => Some(clamped_duration_seconds(answer, completed.end_time)),
                    None => completed.duration_seconds.or_else(|| {
                        record
                            .start_time
                            .map(|start| clamped_duration_seconds(start, completed.end_time))
                    }),
                };
                record.status = CallStatus::Completed;
                record.end_time = Some(completed.end_time);
                record.duration_seconds = duration;
                record.disposition = Some(if answered {
                    Disposition::Answered
                } else {
                    completed.disposition
                });
                record.updated_at = now;
                Ok(true)
            }
        }
    }

    async fn upsert_identity(
        &self,
        call_id: &str,
        identity: &IdentityUpdate,
        allow_late: bool,
    ) -> Result<bool> {
        self.check_calls("upsert_identity", call_id)?;
        let now = Utc::now();
        let mut calls = self.calls.lock();

        match calls.get_mut(call_id) {
            None => {
                let mut record = CallRecord::placeholder(call_id, CallStatus::Identified, now);
                record.user_id = identity.user_id.clone();
                record.contact_id = identity.contact_id;
                record.tenant_id = identity.tenant_id.clone();
                calls.insert(call_id.to_string(), record);
                Ok(true)
            }
            Some(record) if !allow_late && record.status.is_completed() => Ok(false),
            Some(record) => {
                if let Some(user_id) = &identity.user_id {
                    record.user_id = Some(user_id.clone());
                }
                if let Some(contact_id) = identity.contact_id {
                    record.contact_id = Some(contact_id);
                }
                if let Some(tenant_id) = &identity.tenant_id {
                    record.tenant_id = Some(tenant_id.clone());
                }
                if record.status == CallStatus::Started {
                    record.status = CallStatus::Identified;
                }
                record.updated_at = now;
                Ok(true)
            }
        }
    }

    async fn upsert_recording(&self, call_id: &str, recording_url: &str) -> Result<()> {
        self.check_calls("upsert_recording", call_id)?;
        let now = Utc::now();
        let mut calls = self.calls.lock();

        let record = calls
            .entry(call_id.to_string())
            .or_insert_with(|| CallRecord::placeholder(call_id, CallStatus::Started, now));
        record.recording_url = Some(recording_url.to_string());
        record.updated_at = now;
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>> {
        self.check_calls("get", call_id)?;
        Ok(self.calls.lock().get(call_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn completed(end: i64, duration: Option<i32>, disposition: Disposition) -> CompletedCall {
        CompletedCall {
            end_time: at(end),
            duration_seconds: duration,
            disposition,
        }
    }

    #[tokio::test]
    async fn test_started_keeps_first_start_time() {
        let store = MemoryCallStore::new();
        store.upsert_started("c1", at(100)).await.unwrap();
        store.upsert_started("c1", at(90)).await.unwrap();

        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.start_time, Some(at(100)));
        assert_eq!(record.status, CallStatus::Started);
    }

    #[tokio::test]
    async fn test_answered_ignored_after_completion() {
        let store = MemoryCallStore::new();
        store
            .upsert_ended("c1", &completed(140, None, Disposition::NoAnswer))
            .await
            .unwrap();

        assert!(!store.upsert_answered("c1", at(105)).await.unwrap());
        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.answer_time, None);
        assert_eq!(record.disposition, Some(Disposition::NoAnswer));
    }

    #[tokio::test]
    async fn test_ended_is_noop_when_already_completed() {
        let store = MemoryCallStore::new();
        store.upsert_started("c1", at(100)).await.unwrap();
        assert!(store
            .upsert_ended("c1", &completed(140, Some(40), Disposition::Busy))
            .await
            .unwrap());
        assert!(!store
            .upsert_ended("c1", &completed(200, Some(100), Disposition::Failed))
            .await
            .unwrap());

        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.end_time, Some(at(140)));
        assert_eq!(record.duration_seconds, Some(40));
    }

    #[tokio::test]
    async fn test_ended_falls_back_to_stored_start() {
        let store = MemoryCallStore::new();
        store.upsert_started("c1", at(100)).await.unwrap();
        store
            .upsert_ended("c1", &completed(130, None, Disposition::NoAnswer))
            .await
            .unwrap();

        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.duration_seconds, Some(30));
    }

    #[tokio::test]
    async fn test_ended_keeps_stored_answer_over_stale_disposition() {
        let store = MemoryCallStore::new();
        store.upsert_started("c1", at(100)).await.unwrap();
        store.upsert_answered("c1", at(105)).await.unwrap();
        // Computed from a snapshot taken before the answer landed
        store
            .upsert_ended("c1", &completed(140, Some(40), Disposition::Busy))
            .await
            .unwrap();

        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.disposition, Some(Disposition::Answered));
        assert_eq!(record.duration_seconds, Some(35));
    }

    #[tokio::test]
    async fn test_late_start_backfills_duration() {
        let store = MemoryCallStore::new();
        store
            .upsert_ended("c1", &completed(140, None, Disposition::NoAnswer))
            .await
            .unwrap();
        store.upsert_started("c1", at(100)).await.unwrap();

        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Completed);
        assert_eq!(record.start_time, Some(at(100)));
        assert_eq!(record.duration_seconds, Some(40));
    }

    #[tokio::test]
    async fn test_identity_merge_and_promotion() {
        let store = MemoryCallStore::new();
        store.upsert_started("c1", at(100)).await.unwrap();
        store
            .upsert_identity(
                "c1",
                &IdentityUpdate {
                    user_id: Some("u-1".to_string()),
                    contact_id: Some(9),
                    tenant_id: Some("t-1".to_string()),
                },
                true,
            )
            .await
            .unwrap();
        store
            .upsert_identity(
                "c1",
                &IdentityUpdate {
                    tenant_id: Some("t-2".to_string()),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();

        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Identified);
        assert_eq!(record.user_id.as_deref(), Some("u-1"));
        assert_eq!(record.contact_id, Some(9));
        assert_eq!(record.tenant_id.as_deref(), Some("t-2"));
    }

    #[tokio::test]
    async fn test_identity_policy_on_completed_row() {
        let store = MemoryCallStore::new();
        store
            .upsert_ended("c1", &completed(140, None, Disposition::NoAnswer))
            .await
            .unwrap();
        let identity = IdentityUpdate {
            user_id: Some("u-1".to_string()),
            ..Default::default()
        };

        assert!(!store.upsert_identity("c1", &identity, false).await.unwrap());
        assert_eq!(store.get("c1").await.unwrap().unwrap().user_id, None);

        assert!(store.upsert_identity("c1", &identity, true).await.unwrap());
        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.user_id.as_deref(), Some("u-1"));
        assert_eq!(record.status, CallStatus::Completed);
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let store = MemoryCallStore::new();
        store.set_fail_calls(true);
        let err = store.upsert_started("c1", at(0)).await.unwrap_err();
        assert_eq!(err.operation(), "upsert_started");
        assert!(err.to_string().contains("c1"));

        store.set_fail_raw_events(true);
        let event = RawEvent {
            call_id: None,
            event_type: "x".to_string(),
            event_timestamp: at(0),
            payload: "{}".to_string(),
        };
        assert!(store.append_raw_event(&event).await.is_err());
        assert!(store.raw_events().is_empty());
    }
}
