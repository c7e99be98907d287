//! Projection definitions: which events create, update and delete a document.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use store::{
    DecodeError, DecodedEvent, Document, DocumentKey, DocumentMutation, Event, EventDecoder,
    StoredDocument, StreamId, Version,
};

use crate::{FoldError, ProjectionError, Result};

/// Stream position and tag of the event being folded.
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    pub stream_id: StreamId,
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    pub event_type: &'a str,
}

impl<'a> EventContext<'a> {
    fn of(event: &DecodedEvent<'a>) -> Self {
        let envelope = event.envelope();
        Self {
            stream_id: envelope.stream_id,
            version: envelope.version,
            timestamp: envelope.timestamp,
            event_type: &envelope.event_type,
        }
    }
}

/// What a projection does with an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Builds a new document, ignoring any existing one.
    Create,
    /// Updates an existing document.
    Apply,
    /// Receives the existing document, if any, and returns the next one.
    Fold,
    /// Deletes the document.
    Delete,
}

impl HandlerKind {
    pub fn is_delete(self) -> bool {
        self == HandlerKind::Delete
    }
}

/// What an [`apply`](ProjectionDefinition::apply) handler does when there is no
/// document to apply to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingDocumentPolicy {
    /// Fail the whole apply with [`FoldError::MissingDocument`].
    #[default]
    Fail,
    /// Ignore the event.
    Skip,
}

type FoldFn<D> =
    Box<dyn Fn(Option<D>, &DecodedEvent<'_>) -> std::result::Result<D, FoldError> + Send + Sync>;

enum Handler<D> {
    Fold { kind: HandlerKind, fold: FoldFn<D> },
    Delete,
}

impl<D> Handler<D> {
    fn kind(&self) -> HandlerKind {
        match self {
            Handler::Fold { kind, .. } => *kind,
            Handler::Delete => HandlerKind::Delete,
        }
    }
}

fn payload<'e, E: Event>(event: &'e DecodedEvent<'_>) -> std::result::Result<&'e E, FoldError> {
    event
        .downcast_ref::<E>()
        .ok_or_else(|| FoldError::UnexpectedPayload(E::EVENT_TYPE.to_string()))
}

/// Declares how events of one stream fold into a `D` document.
///
/// Each event type maps to at most one handler; registering a second handler
/// for the same event type replaces the first. Event types without a handler
/// are ignored by this projection.
///
/// ```ignore
/// let invited = ProjectionDefinition::<InvitedUser>::new()
///     .create(|e: &UserInvited, _| InvitedUser::from(e))
///     .delete_on::<InvitationAccepted>();
/// ```
pub struct ProjectionDefinition<D: Document> {
    handlers: HashMap<&'static str, Handler<D>>,
    event_types: Vec<fn(&mut EventDecoder) -> std::result::Result<(), DecodeError>>,
    missing_document: MissingDocumentPolicy,
}

impl<D: Document> Default for ProjectionDefinition<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Document> ProjectionDefinition<D> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            event_types: Vec::new(),
            missing_document: MissingDocumentPolicy::default(),
        }
    }

    fn handle<E: Event>(mut self, handler: Handler<D>) -> Self {
        self.event_types.push(EventDecoder::register::<E>);
        self.handlers.insert(E::EVENT_TYPE, handler);
        self
    }

    /// `E` creates the document from scratch.
    pub fn create<E, F>(self, create: F) -> Self
    where
        E: Event,
        F: Fn(&E, &EventContext<'_>) -> D + Send + Sync + 'static,
    {
        let fold: FoldFn<D> = Box::new(move |_prior, event| {
            Ok(create(payload::<E>(event)?, &EventContext::of(event)))
        });
        self.handle::<E>(Handler::Fold {
            kind: HandlerKind::Create,
            fold,
        })
    }

    /// `E` updates an existing document.
    ///
    /// Without a document the outcome follows the definition's
    /// [`MissingDocumentPolicy`].
    pub fn apply<E, F>(self, apply: F) -> Self
    where
        E: Event,
        F: Fn(D, &E, &EventContext<'_>) -> D + Send + Sync + 'static,
    {
        let fold: FoldFn<D> = Box::new(move |prior, event| {
            let document = prior.ok_or(FoldError::MissingDocument)?;
            Ok(apply(document, payload::<E>(event)?, &EventContext::of(event)))
        });
        self.handle::<E>(Handler::Fold {
            kind: HandlerKind::Apply,
            fold,
        })
    }

    /// `E` is folded by a function that sees the existing document, if any,
    /// and may reject the transition.
    pub fn fold<E, F>(self, fold: F) -> Self
    where
        E: Event,
        F: Fn(Option<D>, &E, &EventContext<'_>) -> std::result::Result<D, FoldError>
            + Send
            + Sync
            + 'static,
    {
        let fold: FoldFn<D> = Box::new(move |prior, event| {
            fold(prior, payload::<E>(event)?, &EventContext::of(event))
        });
        self.handle::<E>(Handler::Fold {
            kind: HandlerKind::Fold,
            fold,
        })
    }

    /// `E` deletes the document.
    pub fn delete_on<E: Event>(self) -> Self {
        self.handle::<E>(Handler::Delete)
    }

    /// Sets what `apply` handlers do when no document exists.
    pub fn on_missing_document(mut self, policy: MissingDocumentPolicy) -> Self {
        self.missing_document = policy;
        self
    }
}

/// A registered projection with its document type erased.
///
/// Implemented by every [`ProjectionDefinition`]; the registry and engine only
/// see this trait.
pub trait Projection: Send + Sync {
    /// The document type this projection maintains.
    fn document_type(&self) -> &'static str;

    /// What this projection does with `event_type`, or None if it ignores it.
    fn handler_kind(&self, event_type: &str) -> Option<HandlerKind>;

    /// Every event type this projection handles.
    fn event_types(&self) -> Vec<&'static str>;

    /// Registers the payload types this projection decodes.
    fn register_event_types(&self, decoder: &mut EventDecoder)
    -> std::result::Result<(), DecodeError>;

    /// Folds a batch of events into the current document.
    ///
    /// `events` must be in ascending version order. Returns the single net
    /// mutation for the batch, or None if nothing changed.
    fn fold_batch(
        &self,
        stream_id: StreamId,
        current: Option<StoredDocument>,
        events: &[&DecodedEvent<'_>],
    ) -> Result<Option<DocumentMutation>>;
}

enum Staged {
    Upsert(Version),
    Delete,
}

impl<D: Document> Projection for ProjectionDefinition<D> {
    fn document_type(&self) -> &'static str {
        D::DOCUMENT_TYPE
    }

    fn handler_kind(&self, event_type: &str) -> Option<HandlerKind> {
        self.handlers.get(event_type).map(Handler::kind)
    }

    fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn register_event_types(
        &self,
        decoder: &mut EventDecoder,
    ) -> std::result::Result<(), DecodeError> {
        self.event_types
            .iter()
            .try_for_each(|register| register(decoder))
    }

    fn fold_batch(
        &self,
        stream_id: StreamId,
        current: Option<StoredDocument>,
        events: &[&DecodedEvent<'_>],
    ) -> Result<Option<DocumentMutation>> {
        let mut state: Option<D> = current.map(StoredDocument::into_document).transpose()?;
        let mut staged = None;

        for &event in events {
            match self.handlers.get(event.event_type()) {
                None => continue,
                Some(Handler::Delete) => {
                    state = None;
                    staged = Some(Staged::Delete);
                }
                Some(Handler::Fold { kind, fold }) => {
                    if *kind == HandlerKind::Apply
                        && state.is_none()
                        && self.missing_document == MissingDocumentPolicy::Skip
                    {
                        tracing::trace!(
                            document_type = D::DOCUMENT_TYPE,
                            event_type = event.event_type(),
                            "no document to apply to, skipping"
                        );
                        continue;
                    }

                    let next = fold(state.take(), event).map_err(|source| ProjectionError::Fold {
                        document_type: D::DOCUMENT_TYPE,
                        event_type: event.event_type().to_string(),
                        sequence: event.version(),
                        source,
                    })?;
                    state = Some(next);
                    staged = Some(Staged::Upsert(event.version()));
                }
            }
        }

        match (staged, state) {
            (Some(Staged::Upsert(version)), Some(document)) => Ok(Some(DocumentMutation::Upsert(
                StoredDocument::from_document(stream_id, version, &document)?,
            ))),
            (Some(Staged::Delete), _) => Ok(Some(DocumentMutation::Delete(DocumentKey::of::<D>(
                stream_id,
            )))),
            _ => Ok(None),
        }
    }
}
