//! Shared types for the CDR service
//!
//! Holds the call record model, the acknowledgment vocabulary shared by the
//! dispatch loop and the message handler, and the cross-cutting logging and
//! PII helpers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;
pub mod pii;

// ============================================================================
// Call Record Types
// ============================================================================

/// Lifecycle status of a call record.
///
/// Ordered by how much is known about the call: a record may move up the
/// ranking but never back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Started,
    Identified,
    Completed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Started => "STARTED",
            CallStatus::Identified => "IDENTIFIED",
            CallStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, CallStatus::Completed)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(CallStatus::Started),
            "IDENTIFIED" => Ok(CallStatus::Identified),
            "COMPLETED" => Ok(CallStatus::Completed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Final classification of how a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Failed,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Answered => "ANSWERED",
            Disposition::NoAnswer => "NO_ANSWER",
            Disposition::Busy => "BUSY",
            Disposition::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ANSWERED" => Ok(Disposition::Answered),
            "NO_ANSWER" => Ok(Disposition::NoAnswer),
            "BUSY" => Ok(Disposition::Busy),
            "FAILED" => Ok(Disposition::Failed),
            other => Err(DomainError::UnknownDisposition(other.to_string())),
        }
    }
}

/// One row of the `calls` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub status: CallStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub disposition: Option<Disposition>,
    pub user_id: Option<String>,
    pub contact_id: Option<i64>,
    pub tenant_id: Option<String>,
    pub recording_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// Empty placeholder row for a call we have not seen before
    pub fn placeholder(call_id: &str, status: CallStatus, now: DateTime<Utc>) -> Self {
        Self {
            call_id: call_id.to_string(),
            status,
            start_time: None,
            answer_time: None,
            end_time: None,
            duration_seconds: None,
            disposition: None,
            user_id: None,
            contact_id: None,
            tenant_id: None,
            recording_url: None,
            updated_at: now,
        }
    }

    /// Lifecycle fields read before computing a call-ended update
    pub fn lifecycle(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            start_time: self.start_time,
            answer_time: self.answer_time,
            disposition: self.disposition,
        }
    }
}

/// The subset of lifecycle fields the call-ended path reads first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    pub start_time: Option<DateTime<Utc>>,
    pub answer_time: Option<DateTime<Utc>>,
    pub disposition: Option<Disposition>,
}

/// Values written when a call completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCall {
    pub end_time: DateTime<Utc>,
    /// `None` when neither start nor answer time was known at compute time
    pub duration_seconds: Option<i32>,
    pub disposition: Disposition,
}

/// Identity enrichment for a call. `None` fields leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityUpdate {
    pub user_id: Option<String>,
    pub contact_id: Option<i64>,
    pub tenant_id: Option<String>,
}

impl IdentityUpdate {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.contact_id.is_none() && self.tenant_id.is_none()
    }
}

/// One append-only row of the `call_events` audit table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Generic events may not name a call
    pub call_id: Option<String>,
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    /// The message body exactly as received
    pub payload: String,
}

/// Whole seconds from `from` to `to`, clamped at zero for skewed clocks.
pub fn clamped_duration_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> i32 {
    let seconds = (to - from).num_seconds();
    seconds.clamp(0, i64::from(i32::MAX)) as i32
}

// ============================================================================
// Acknowledgment Types
// ============================================================================

/// What the dispatch loop tells the broker once a delivery has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckAction {
    /// Processed (or deliberately ignored); remove from the queue
    Ack,
    /// Transient failure; leave on the queue for redelivery
    NackRequeue,
    /// Permanent failure; reject without requeue so the broker dead-letters it
    NackDiscard,
}

impl AckAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckAction::Ack => "ack",
            AckAction::NackRequeue => "nack_requeue",
            AckAction::NackDiscard => "nack_discard",
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("{0} is not a valid call status")]
    UnknownStatus(String),

    #[error("{0} is not a valid disposition")]
    UnknownDisposition(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ranking() {
        assert!(CallStatus::Started < CallStatus::Identified);
        assert!(CallStatus::Identified < CallStatus::Completed);
        assert!(CallStatus::Completed.is_completed());
        assert!(!CallStatus::Identified.is_completed());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("COMPLETED".parse::<CallStatus>(), Ok(CallStatus::Completed));
        assert_eq!(
            "done".parse::<CallStatus>(),
            Err(DomainError::UnknownStatus("done".to_string()))
        );
    }

    #[test]
    fn test_disposition_parse() {
        assert_eq!("NO_ANSWER".parse::<Disposition>(), Ok(Disposition::NoAnswer));
        assert_eq!(Disposition::Busy.to_string(), "BUSY");
        assert!("answered".parse::<Disposition>().is_err());
    }

    #[test]
    fn test_identity_update_is_empty() {
        assert!(IdentityUpdate::default().is_empty());
        let update = IdentityUpdate {
            tenant_id: Some("t-1".to_string()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }

    #[test]
    fn test_clamped_duration_seconds() {
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:01:40Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = start + chrono::Duration::seconds(35);
        assert_eq!(clamped_duration_seconds(start, end), 35);
        assert_eq!(clamped_duration_seconds(end, start), 0);
        assert_eq!(
            clamped_duration_seconds(start, start + chrono::Duration::milliseconds(999)),
            0
        );
    }

    #[test]
    fn test_placeholder_has_no_lifecycle() {
        let now = Utc::now();
        let record = CallRecord::placeholder("c-1", CallStatus::Identified, now);
        assert_eq!(record.lifecycle(), LifecycleSnapshot::default());
        assert_eq!(record.updated_at, now);
    }
}
