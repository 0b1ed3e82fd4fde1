//! Call record persistence
//!
//! [`CallStore`] is the port the reconciliation engine writes through. Every
//! mutating method is a single atomic insert-or-update keyed on `call_id`;
//! concurrent workers racing on the same call are resolved by the store,
//! never by an in-process lock.
//!
//! - `postgres` (feature `postgres`): the production adapter over `sqlx`
//! - `memory`: an in-process adapter with the same semantics, for tests

use async_trait::async_trait;
use cdr_common::{CallRecord, CompletedCall, IdentityUpdate, LifecycleSnapshot, RawEvent};
use chrono::{DateTime, Utc};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryCallStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresCallStore;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{operation} failed for call {call_id}: {source}")]
    Query {
        operation: &'static str,
        call_id: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid {column} stored for call {call_id}: {reason}")]
    Decode {
        call_id: String,
        column: &'static str,
        reason: String,
    },

    #[error("schema bootstrap failed: {0}")]
    Schema(#[source] BoxError),
}

impl StoreError {
    pub fn query(operation: &'static str, call_id: Option<&str>, source: impl Into<BoxError>) -> Self {
        StoreError::Query {
            operation,
            call_id: call_id.unwrap_or("-").to_string(),
            source: source.into(),
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            StoreError::Query { operation, .. } => operation,
            StoreError::Decode { .. } => "decode",
            StoreError::Schema(_) => "init_schema",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CallStore: Send + Sync {
    /// Append one row to the audit log. Never updates or deletes.
    async fn append_raw_event(&self, event: &RawEvent) -> Result<()>;

    /// Record a call start. Keeps an earlier `start_time` and never changes
    /// status; on a completed row with no duration yet, backfills it.
    async fn upsert_started(&self, call_id: &str, start_time: DateTime<Utc>) -> Result<()>;

    /// Record an answer. Returns `false` when the call was already completed
    /// and nothing changed.
    async fn upsert_answered(&self, call_id: &str, answer_time: DateTime<Utc>) -> Result<bool>;

    /// Read `start_time`, `answer_time` and `disposition` ahead of completion.
    async fn lifecycle_snapshot(&self, call_id: &str) -> Result<Option<LifecycleSnapshot>>;

    /// Complete the call. A row that is already completed is left untouched
    /// and `false` is returned. An answer stored after `completed` was
    /// computed still wins: disposition stays ANSWERED and duration runs
    /// from the stored answer time.
    async fn upsert_ended(&self, call_id: &str, completed: &CompletedCall) -> Result<bool>;

    /// Merge identity fields. `None` fields keep the stored value. With
    /// `allow_late = false` a completed row is left untouched.
    async fn upsert_identity(
        &self,
        call_id: &str,
        identity: &IdentityUpdate,
        allow_late: bool,
    ) -> Result<bool>;

    async fn upsert_recording(&self, call_id: &str, recording_url: &str) -> Result<()>;

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>>;
}
