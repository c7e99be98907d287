//! Registry of inline projections.

use store::{Document, Event, EventDecoder};

use crate::definition::{HandlerKind, Projection, ProjectionDefinition};
use crate::{ProjectionError, Result};

/// Holds every registered projection, at most one per document type.
///
/// Also owns the [`EventDecoder`] for every event type a projection handles,
/// plus any extra types registered with [`register_event`](Self::register_event).
/// The registry is built once at startup and read-only afterwards.
#[derive(Default)]
pub struct ProjectionRegistry {
    projections: Vec<Box<dyn Projection>>,
    decoder: EventDecoder,
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the projection maintaining `D` documents.
    ///
    /// Fails with [`ProjectionError::DuplicateProjection`] if `D` already has one.
    pub fn register<D: Document>(&mut self, definition: ProjectionDefinition<D>) -> Result<()> {
        self.register_projection(Box::new(definition))
    }

    /// Registers a type-erased projection.
    pub fn register_projection(&mut self, projection: Box<dyn Projection>) -> Result<()> {
        let document_type = projection.document_type();
        if self.projection(document_type).is_some() {
            return Err(ProjectionError::DuplicateProjection(document_type));
        }

        // Decode into a scratch copy so a conflicting event type leaves the
        // registry untouched.
        let mut decoder = self.decoder.clone();
        projection.register_event_types(&mut decoder)?;
        self.decoder = decoder;

        tracing::info!(
            document_type,
            event_types = ?projection.event_types(),
            "projection registered"
        );
        self.projections.push(projection);
        Ok(())
    }

    /// Registers an event type no projection handles, so that sessions accept
    /// it without warning.
    pub fn register_event<E: Event>(&mut self) -> Result<()> {
        self.decoder.register::<E>()?;
        Ok(())
    }

    /// What the projection for `document_type` does with `event_type`.
    ///
    /// None if there is no such projection or it ignores the event type.
    pub fn handlers_for(&self, document_type: &str, event_type: &str) -> Option<HandlerKind> {
        self.projection(document_type)?.handler_kind(event_type)
    }

    /// The projection maintaining `document_type`, if registered.
    pub fn projection(&self, document_type: &str) -> Option<&dyn Projection> {
        self.projections
            .iter()
            .find(|p| p.document_type() == document_type)
            .map(Box::as_ref)
    }

    /// Registered projections, in registration order.
    pub fn projections(&self) -> impl Iterator<Item = &dyn Projection> {
        self.projections.iter().map(Box::as_ref)
    }

    /// Whether any projection handles `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.projections
            .iter()
            .any(|p| p.handler_kind(event_type).is_some())
    }

    /// Document types of every registered projection.
    pub fn document_types(&self) -> Vec<&'static str> {
        self.projections.iter().map(|p| p.document_type()).collect()
    }

    pub fn decoder(&self) -> &EventDecoder {
        &self.decoder
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }
}

impl std::fmt::Debug for ProjectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionRegistry")
            .field("document_types", &self.document_types())
            .field("decoder", &self.decoder)
            .finish()
    }
}
