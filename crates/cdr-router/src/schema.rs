//! Call event wire schemas
//!
//! Bodies are JSON objects with camelCase keys. Every known schema carries
//! an `eventType` discriminator; the generic schema catches anything else
//! that at least names its type.

use chrono::{DateTime, Utc};
use serde::Deserialize;

pub const CALL_STARTED: &str = "call.started";
pub const CALL_ANSWERED: &str = "call.answered";
pub const CALL_ENDED: &str = "call.ended";
pub const USER_IDENTIFIED: &str = "user.identified.for_call";
pub const RECORDING_AVAILABLE: &str = "call.recording.available";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStarted {
    pub event_type: String,
    pub trace_id: Option<String>,
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    /// SIP URI of the caller
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswered {
    pub event_type: String,
    pub trace_id: Option<String>,
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub event_type: String,
    pub trace_id: Option<String>,
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    pub termination_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifiedUser {
    pub id: Option<String>,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentifiedContact {
    pub id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentified {
    pub event_type: String,
    pub trace_id: Option<String>,
    pub call_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Missing when the platform could not resolve the caller
    pub user: Option<IdentifiedUser>,
    pub contact: Option<IdentifiedContact>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingAvailable {
    pub event_type: String,
    pub trace_id: Option<String>,
    pub call_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub recording_uri: String,
}

/// Forward-compatible catch-all
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericEvent {
    pub event_type: String,
    pub trace_id: Option<String>,
    pub call_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Option<serde_json::Value>,
}

/// A body that matched one of the known schemas
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Started(CallStarted),
    Answered(CallAnswered),
    Ended(CallEnded),
    UserIdentified(UserIdentified),
    RecordingAvailable(RecordingAvailable),
    Generic(GenericEvent),
}

impl DecodedEvent {
    pub fn event_type(&self) -> &str {
        match self {
            DecodedEvent::Started(e) => &e.event_type,
            DecodedEvent::Answered(e) => &e.event_type,
            DecodedEvent::Ended(e) => &e.event_type,
            DecodedEvent::UserIdentified(e) => &e.event_type,
            DecodedEvent::RecordingAvailable(e) => &e.event_type,
            DecodedEvent::Generic(e) => &e.event_type,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            DecodedEvent::Started(e) => Some(&e.call_id),
            DecodedEvent::Answered(e) => Some(&e.call_id),
            DecodedEvent::Ended(e) => Some(&e.call_id),
            DecodedEvent::UserIdentified(e) => Some(&e.call_id),
            DecodedEvent::RecordingAvailable(e) => Some(&e.call_id),
            DecodedEvent::Generic(e) => e.call_id.as_deref(),
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        match self {
            DecodedEvent::Started(e) => e.trace_id.as_deref(),
            DecodedEvent::Answered(e) => e.trace_id.as_deref(),
            DecodedEvent::Ended(e) => e.trace_id.as_deref(),
            DecodedEvent::UserIdentified(e) => e.trace_id.as_deref(),
            DecodedEvent::RecordingAvailable(e) => e.trace_id.as_deref(),
            DecodedEvent::Generic(e) => e.trace_id.as_deref(),
        }
    }

    /// Producer timestamp, when the schema carries one
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            DecodedEvent::Started(e) => Some(e.timestamp),
            DecodedEvent::Answered(e) => Some(e.timestamp),
            DecodedEvent::Ended(e) => Some(e.timestamp),
            DecodedEvent::UserIdentified(e) => e.timestamp,
            DecodedEvent::RecordingAvailable(e) => e.timestamp,
            DecodedEvent::Generic(e) => e.timestamp,
        }
    }
}
