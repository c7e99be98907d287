//! Type-tag based decoding of stored events.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::{Event, EventEnvelope, Version};

/// Errors produced while decoding a stored event.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No event type is registered under this tag.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The tag is already registered for a different Rust type.
    #[error("Event type {0} is registered for a different payload type")]
    ConflictingEventType(String),

    /// The payload does not match the registered type.
    #[error("Failed to decode {event_type} at version {version}: {source}")]
    Payload {
        event_type: String,
        version: Version,
        #[source]
        source: serde_json::Error,
    },
}

type DecodeFn = fn(&serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error>;

fn decode_payload<E: Event>(
    payload: &serde_json::Value,
) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> {
    Ok(Box::new(E::deserialize(payload)?))
}

/// Maps event type tags to the concrete payload types they decode into.
#[derive(Debug, Default, Clone)]
pub struct EventDecoder {
    types: HashMap<&'static str, (TypeId, DecodeFn)>,
}

impl EventDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `E` under its [`Event::EVENT_TYPE`] tag.
    ///
    /// Registering the same type twice is a no-op.
    pub fn register<E: Event>(&mut self) -> Result<(), DecodeError> {
        let type_id = TypeId::of::<E>();
        match self.types.get(E::EVENT_TYPE) {
            Some((existing, _)) if *existing != type_id => Err(
                DecodeError::ConflictingEventType(E::EVENT_TYPE.to_string()),
            ),
            Some(_) => Ok(()),
            None => {
                self.types
                    .insert(E::EVENT_TYPE, (type_id, decode_payload::<E> as DecodeFn));
                Ok(())
            }
        }
    }

    /// Returns whether a tag is registered.
    pub fn is_known(&self, event_type: &str) -> bool {
        self.types.contains_key(event_type)
    }

    /// Returns the number of registered event types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if no event types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Decodes a stored event into its typed payload.
    pub fn decode<'a>(&self, envelope: &'a EventEnvelope) -> Result<DecodedEvent<'a>, DecodeError> {
        let (_, decode) = self
            .types
            .get(envelope.event_type.as_str())
            .ok_or_else(|| DecodeError::UnknownEventType(envelope.event_type.clone()))?;

        let payload = decode(&envelope.payload).map_err(|source| DecodeError::Payload {
            event_type: envelope.event_type.clone(),
            version: envelope.version,
            source,
        })?;

        Ok(DecodedEvent { envelope, payload })
    }
}

/// A stored event together with its decoded payload.
pub struct DecodedEvent<'a> {
    envelope: &'a EventEnvelope,
    payload: Box<dyn Any + Send + Sync>,
}

impl<'a> DecodedEvent<'a> {
    /// The envelope the payload was decoded from.
    pub fn envelope(&self) -> &'a EventEnvelope {
        self.envelope
    }

    pub fn event_type(&self) -> &'a str {
        &self.envelope.event_type
    }

    pub fn version(&self) -> Version {
        self.envelope.version
    }

    /// Returns the payload if it is an `E`.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }
}

impl std::fmt::Debug for DecodedEvent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedEvent")
            .field("event_type", &self.envelope.event_type)
            .field("stream_id", &self.envelope.stream_id)
            .field("version", &self.envelope.version)
            .finish_non_exhaustive()
    }
}
