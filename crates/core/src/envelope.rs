//! Outgoing message envelope and its builder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::context;
use crate::error::ErrorKind;
use crate::event::{App, Event, QualifiedEvent};

/// Top-level keys owned by the envelope; extras may not overwrite them.
pub const RESERVED_FIELDS: [&str; 4] = ["message_id", "request_id", "event", "created_at"];

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The builder was handed something that is not a registered event
    /// (typically the `None` of a failed lookup).
    #[error("envelope requires a registered event")]
    NotAnEvent,

    #[error("failed to serialize envelope {message_id}: {source}")]
    Serialize {
        message_id: Uuid,
        #[source]
        source: serde_json::Error,
    },
}

impl EnvelopeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnvelopeError::NotAnEvent => ErrorKind::Warning,
            EnvelopeError::Serialize { .. } => ErrorKind::Error,
        }
    }
}

/// Message envelope: one published event plus caller-supplied fields.
///
/// Wire form is a flat JSON object: the four reserved keys plus every extra
/// field at the top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    message_id: Uuid,
    request_id: Option<String>,
    event: QualifiedEvent,
    created_at: DateTime<Utc>,

    #[serde(flatten)]
    fields: Map<String, JsonValue>,
}

impl Envelope {
    /// Start building an envelope for a registered event.
    ///
    /// Takes the result of an event lookup directly; a missing event is
    /// rejected with a warning and nothing can be published.
    ///
    /// `message_id`, `created_at` and the calling thread's `request_id` are
    /// captured here.
    pub fn build(event: Option<&Event>) -> Result<EnvelopeBuilder, EnvelopeError> {
        let Some(event) = event else {
            warn!("refusing to build an envelope without a registered event");
            return Err(EnvelopeError::NotAnEvent);
        };

        Ok(EnvelopeBuilder {
            envelope: Envelope {
                message_id: Uuid::now_v7(),
                request_id: context::request_id(),
                event: event.qualified().clone(),
                created_at: Utc::now(),
                fields: Map::new(),
            },
        })
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn event(&self) -> &QualifiedEvent {
        &self.event
    }

    /// Exchange this envelope must be published to.
    pub fn exchange(&self) -> &App {
        self.event.app()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key)
    }

    pub fn try_to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|source| EnvelopeError::Serialize {
            message_id: self.message_id,
            source,
        })
    }

    /// Serialize to the wire form; logs and returns an empty string on failure.
    pub fn to_json(&self) -> String {
        match self.try_to_json() {
            Ok(json) => json,
            Err(err) => {
                error!(message_id = %self.message_id, event = %self.event, error = %err, "envelope serialization failed");
                String::new()
            }
        }
    }
}

/// Collects extra fields for an [`Envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    /// Attach a field.
    ///
    /// Values that do not map onto JSON (e.g. maps with non-string keys) fall
    /// back to their `Debug` rendering. Reserved keys are dropped with a warning.
    pub fn field<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Serialize + core::fmt::Debug,
    {
        let value = serde_json::to_value(&value)
            .unwrap_or_else(|_| JsonValue::String(format!("{value:?}")));
        self.insert(key.into(), value);
        self
    }

    /// Attach a field by its `Display` rendering.
    pub fn field_display(mut self, key: impl Into<String>, value: impl core::fmt::Display) -> Self {
        self.insert(key.into(), JsonValue::String(value.to_string()));
        self
    }

    /// Attach every entry of a JSON object.
    pub fn fields(mut self, fields: Map<String, JsonValue>) -> Self {
        for (key, value) in fields {
            self.insert(key, value);
        }
        self
    }

    pub fn finish(self) -> Envelope {
        self.envelope
    }

    fn insert(&mut self, key: String, value: JsonValue) {
        if RESERVED_FIELDS.contains(&key.as_str()) {
            warn!(
                field = %key,
                event = %self.envelope.event,
                "dropping envelope field that shadows a reserved key"
            );
            return;
        }
        self.envelope.fields.insert(key, value);
    }
}
