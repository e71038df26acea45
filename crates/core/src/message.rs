//! Consume-side view of an envelope.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::error::{ErrorKind, NameError};
use crate::event::{EventName, QualifiedEvent};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("message body is not a JSON object")]
    NotAnObject,

    #[error("message has no `event` field")]
    MissingEvent,

    #[error("message `event` field is malformed: {0}")]
    MalformedEvent(NameError),
}

impl MessageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Error
    }
}

/// A delivered envelope decoded into a generic JSON map.
///
/// Listeners receive this rather than a typed [`crate::Envelope`]: the
/// consumer side only relies on the `event` key, every other key is opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    event: QualifiedEvent,
    body: Map<String, JsonValue>,
}

impl Message {
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: JsonValue = serde_json::from_slice(bytes)?;
        let JsonValue::Object(body) = value else {
            return Err(MessageError::NotAnObject);
        };
        Self::from_map(body)
    }

    pub fn from_map(body: Map<String, JsonValue>) -> Result<Self, MessageError> {
        let event = body
            .get("event")
            .and_then(JsonValue::as_str)
            .ok_or(MessageError::MissingEvent)?;
        let event = QualifiedEvent::parse(event).map_err(MessageError::MalformedEvent)?;
        Ok(Self { event, body })
    }

    pub fn event(&self) -> &QualifiedEvent {
        &self.event
    }

    /// Suffix of `event`, used for listener lookup.
    pub fn event_name(&self) -> &EventName {
        self.event.event_name()
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.body.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(JsonValue::as_str)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get_str("message_id")
    }

    pub fn request_id(&self) -> Option<&str> {
        self.get_str("request_id")
    }

    pub fn body(&self) -> &Map<String, JsonValue> {
        &self.body
    }

    pub fn into_body(self) -> Map<String, JsonValue> {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::envelope::Envelope;
    use crate::event::{App, Event};

    #[test]
    fn decodes_published_envelope() {
        let event = Event::new(App::new("policy").unwrap(), EventName::new("PolicyPublished").unwrap());
        let envelope = Envelope::build(Some(&event))
            .unwrap()
            .field("policy_id", "P-7")
            .finish();

        let message = Message::decode(envelope.to_json().as_bytes()).unwrap();
        assert_eq!(message.event().to_string(), "policy::PolicyPublished");
        assert_eq!(message.event_name().as_str(), "PolicyPublished");
        assert_eq!(message.get_str("policy_id"), Some("P-7"));
        assert_eq!(message.message_id(), Some(envelope.message_id().to_string().as_str()));
    }

    #[test]
    fn rejects_bodies_without_a_valid_event() {
        assert!(matches!(Message::decode(b"not json"), Err(MessageError::Decode(_))));
        assert!(matches!(Message::decode(b"[1,2]"), Err(MessageError::NotAnObject)));
        assert!(matches!(
            Message::decode(json!({"x": 1}).to_string().as_bytes()),
            Err(MessageError::MissingEvent)
        ));
        assert!(matches!(
            Message::decode(json!({"event": "Unqualified"}).to_string().as_bytes()),
            Err(MessageError::MalformedEvent(_))
        ));
    }
}
