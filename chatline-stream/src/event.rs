//! Stream events and frame encoding.
//!
//! Incoming frames are JSON objects of the form `{ "type"?: string, ... }`.
//! The whole object is kept as the event payload. Outgoing frames are
//! `{ "type": string, "data": any, "timestamp": RFC 3339 }`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

use chatline_core::Timestamp;

use crate::category::EventCategory;

/// A frame that could not be turned into a [`StreamEvent`].
///
/// Reported to `All` listeners; never changes connection state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("Expected a JSON object, got {found}")]
    NotAnObject { found: &'static str },

    #[error("Field 'type' must be a string")]
    InvalidType,
}

/// A decoded event, dispatched once and not retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub category: EventCategory,
    pub payload: JsonValue,
    pub received_at: Timestamp,
}

impl StreamEvent {
    pub fn new(category: EventCategory, payload: JsonValue, received_at: Timestamp) -> Self {
        Self {
            category,
            payload,
            received_at,
        }
    }

    /// The local event reported for an undecodable frame.
    pub fn parse_error(error: &ParseError, raw: &str, received_at: Timestamp) -> Self {
        Self::new(
            EventCategory::ParseError,
            json!({ "error": error.to_string(), "raw": raw }),
            received_at,
        )
    }

    /// String field of the payload, if present.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(JsonValue::as_str)
    }

    /// `conversation_id` carried by the payload, at the top level or under
    /// `data`.
    pub fn conversation_id(&self) -> Option<&str> {
        self.field_str("conversation_id").or_else(|| {
            self.payload
                .get("data")
                .and_then(|data| data.get("conversation_id"))
                .and_then(JsonValue::as_str)
        })
    }
}

/// Decode one incoming text frame.
pub fn decode_frame(text: &str, received_at: Timestamp) -> Result<StreamEvent, ParseError> {
    let value: JsonValue = serde_json::from_str(text).map_err(|err| ParseError::InvalidJson {
        reason: err.to_string(),
    })?;
    let object: &Map<String, JsonValue> = match &value {
        JsonValue::Object(object) => object,
        other => {
            return Err(ParseError::NotAnObject {
                found: json_kind(other),
            })
        }
    };
    let kind = match object.get("type") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(kind)) => Some(kind.as_str()),
        Some(_) => return Err(ParseError::InvalidType),
    };
    let category = EventCategory::from_wire(kind);
    Ok(StreamEvent::new(category, value, received_at))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Wire shape of an outgoing frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: JsonValue,
    pub timestamp: Timestamp,
}

/// Encode an outgoing frame.
pub fn encode_frame(
    category: &EventCategory,
    data: JsonValue,
    timestamp: Timestamp,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutgoingFrame {
        kind: category.as_str().to_string(),
        data,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(millis: i64) -> Timestamp {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_decode_typed_frame() {
        let event = decode_frame(r#"{"type":"conversation_completed","conversation_id":"c1"}"#, at(5)).unwrap();
        assert_eq!(event.category, EventCategory::ConversationCompleted);
        assert_eq!(event.conversation_id(), Some("c1"));
        assert_eq!(event.received_at, at(5));
    }

    #[test]
    fn test_decode_untyped_frame_is_message() {
        let event = decode_frame(r#"{"content":"hi"}"#, at(0)).unwrap();
        assert_eq!(event.category, EventCategory::Message);
        assert_eq!(event.field_str("content"), Some("hi"));
    }

    #[test]
    fn test_null_type_is_message() {
        let event = decode_frame(r#"{"type":null}"#, at(0)).unwrap();
        assert_eq!(event.category, EventCategory::Message);
    }

    #[test]
    fn test_conversation_id_under_data() {
        let event = decode_frame(r#"{"type":"message","data":{"conversation_id":"c9"}}"#, at(0)).unwrap();
        assert_eq!(event.conversation_id(), Some("c9"));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(decode_frame("{oops", at(0)), Err(ParseError::InvalidJson { .. })));
        assert_eq!(
            decode_frame("[1,2]", at(0)),
            Err(ParseError::NotAnObject { found: "an array" })
        );
        assert_eq!(decode_frame(r#"{"type":7}"#, at(0)), Err(ParseError::InvalidType));
    }

    #[test]
    fn test_parse_error_event_keeps_raw_text() {
        let err = ParseError::InvalidType;
        let event = StreamEvent::parse_error(&err, "{\"type\":7}", at(1));
        assert_eq!(event.category, EventCategory::ParseError);
        assert_eq!(event.field_str("raw"), Some("{\"type\":7}"));
    }

    #[test]
    fn test_encode_frame_shape() {
        let text = encode_frame(&EventCategory::Message, json!({"content": "hello"}), at(0)).unwrap();
        let value: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["content"], "hello");
        assert_eq!(value["timestamp"], "1970-01-01T00:00:00Z");
    }
}
