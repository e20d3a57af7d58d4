//! Event trait and related types for the pipeline.
//!
//! An application describes everything that can happen in it as one closed
//! enum implementing [`Event`]. Each variant reports a stable kind string
//! (its `event_type`), which is what handlers are registered against and what
//! gets persisted next to the payload.
//!
//! # Design
//!
//! Event bodies are serialized with `bincode`. The kind string and a schema
//! version travel alongside the bytes in [`SerializedEvent`], so a worker can
//! route an event without decoding it and can refuse payloads whose decoded
//! variant disagrees with the stored kind.
//!
//! # Example
//!
//! ```
//! use eventline_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum FormEvent {
//!     FormSubmitted { form_id: String },
//!     FormRejected { form_id: String, reason: String },
//! }
//!
//! impl Event for FormEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             FormEvent::FormSubmitted { .. } => "FormSubmitted.v1",
//!             FormEvent::FormRejected { .. } => "FormRejected.v1",
//!         }
//!     }
//! }
//! ```

use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The decoded variant does not match the kind stored with the payload.
    #[error("Event kind mismatch: stored as {stored}, decoded as {decoded}")]
    KindMismatch {
        /// Kind persisted next to the payload.
        stored: String,
        /// Kind reported by the decoded value.
        decoded: &'static str,
    },
}

/// A domain event that can be published to the queue and replayed from the log.
///
/// # Event Naming Convention
///
/// The `event_type()` method should return a stable string identifier that
/// includes a version number, e.g. `"FormSubmitted.v1"`. Handlers are keyed by
/// this string, so renaming a kind orphans its registrations.
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` to be shared between worker tasks.
pub trait Event: Send + Sync + 'static {
    /// Returns the kind identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Schema version persisted with the payload.
    ///
    /// Defaults to `1`. Bump it together with the `.vN` suffix of the kind
    /// when a variant's shape changes.
    fn schema_version(&self) -> i32 {
        1
    }

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// were produced by an incompatible schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// A serialized event ready for storage.
///
/// This is the wire format between the application and the store. The kind
/// string is duplicated outside of `data` so rows can be routed and inspected
/// without decoding.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedEvent {
    /// The event kind (e.g., "FormSubmitted.v1").
    pub event_type: String,

    /// Schema version of `data`.
    pub schema_version: i32,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata in JSONB format.
    ///
    /// Common metadata fields:
    /// - `correlation_id`: Links a follow-up event to the one that caused it
    /// - `submitted_by`: The user who triggered this event
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event at schema version 1.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventline_core::event::SerializedEvent;
    ///
    /// let event = SerializedEvent::new("FormSubmitted.v1".to_string(), vec![1, 2, 3], None);
    /// assert_eq!(event.schema_version, 1);
    /// ```
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            schema_version: 1,
            data,
            metadata,
        }
    }

    /// Override the schema version.
    #[must_use]
    pub const fn with_schema_version(mut self, schema_version: i32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Create a serialized event from a typed event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventline_core::event::{Event, SerializedEvent};
    /// # use serde::{Serialize, Deserialize};
    /// # #[derive(Clone, Debug, Serialize, Deserialize)]
    /// # enum FormEvent {
    /// #     FormSubmitted { form_id: String },
    /// # }
    /// # impl Event for FormEvent {
    /// #     fn event_type(&self) -> &'static str { "FormSubmitted.v1" }
    /// # }
    ///
    /// let event = FormEvent::FormSubmitted { form_id: "form-1".to_string() };
    /// let serialized = SerializedEvent::from_event(&event, None).unwrap();
    /// assert_eq!(serialized.event_type, "FormSubmitted.v1");
    /// ```
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            schema_version: event.schema_version(),
            data: event.to_bytes()?,
            metadata,
        })
    }

    /// Decode the payload into the application's event type.
    ///
    /// The decoded value must report the same kind that was stored; a payload
    /// that decodes into a different variant is rejected.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes don't decode and
    /// `EventError::KindMismatch` if they decode into the wrong variant.
    pub fn decode<E: Event + DeserializeOwned>(&self) -> Result<E, EventError> {
        let event = E::from_bytes(&self.data)?;
        if event.event_type() != self.event_type {
            return Err(EventError::KindMismatch {
                stored: self.event_type.clone(),
                decoded: event.event_type(),
            });
        }
        Ok(event)
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, version: {}, size: {} bytes }}",
            self.event_type,
            self.schema_version,
            self.data.len()
        )
    }
}
