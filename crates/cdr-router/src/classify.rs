//! Event Router
//!
//! Classifies a raw body by trying each schema in a fixed order. A schema
//! wins only when the `eventType` discriminator matches *and* the body
//! decodes into it; two shapes that overlap structurally are told apart by
//! the discriminator alone. The generic schema is last and accepts any
//! object with a non-empty `eventType`.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::schema::{
    DecodedEvent, CALL_ANSWERED, CALL_ENDED, CALL_STARTED, RECORDING_AVAILABLE, USER_IDENTIFIED,
};

type Decoder = fn(&Value) -> Option<DecodedEvent>;

struct Schema {
    /// `None` matches any discriminator
    discriminator: Option<&'static str>,
    decode: Decoder,
}

fn decode_as<T, F>(value: &Value, wrap: F) -> Option<DecodedEvent>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> DecodedEvent,
{
    T::deserialize(value).ok().map(wrap)
}

fn started(value: &Value) -> Option<DecodedEvent> {
    decode_as(value, DecodedEvent::Started)
}

fn answered(value: &Value) -> Option<DecodedEvent> {
    decode_as(value, DecodedEvent::Answered)
}

fn ended(value: &Value) -> Option<DecodedEvent> {
    decode_as(value, DecodedEvent::Ended)
}

fn user_identified(value: &Value) -> Option<DecodedEvent> {
    decode_as(value, DecodedEvent::UserIdentified)
}

fn recording_available(value: &Value) -> Option<DecodedEvent> {
    decode_as(value, DecodedEvent::RecordingAvailable)
}

fn generic(value: &Value) -> Option<DecodedEvent> {
    decode_as(value, DecodedEvent::Generic)
}

/// Evaluated top to bottom; first match wins.
const SCHEMAS: &[Schema] = &[
    Schema {
        discriminator: Some(CALL_STARTED),
        decode: started,
    },
    Schema {
        discriminator: Some(CALL_ANSWERED),
        decode: answered,
    },
    Schema {
        discriminator: Some(CALL_ENDED),
        decode: ended,
    },
    Schema {
        discriminator: Some(USER_IDENTIFIED),
        decode: user_identified,
    },
    Schema {
        discriminator: Some(RECORDING_AVAILABLE),
        decode: recording_available,
    },
    Schema {
        discriminator: None,
        decode: generic,
    },
];

/// Why a body could not be routed. Never worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized event: {reason}")]
pub struct Unrecognized {
    pub reason: String,
}

impl Unrecognized {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Classify `body` into exactly one known schema, or reject it.
pub fn route(body: &[u8]) -> Result<DecodedEvent, Unrecognized> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Unrecognized::new(format!("body is not JSON: {e}")))?;

    let event_type = match value.get("eventType") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.as_str(),
        Some(_) => return Err(Unrecognized::new("eventType is empty or not a string")),
        None => return Err(Unrecognized::new("eventType is missing")),
    };

    SCHEMAS
        .iter()
        .filter(|schema| schema.discriminator.map_or(true, |d| d == event_type))
        .find_map(|schema| (schema.decode)(&value))
        .ok_or_else(|| Unrecognized::new(format!("no schema accepts event type {event_type}")))
}
