//! Projection error types.

use store::{DecodeError, StoreError, Version};
use thiserror::Error;

/// Why a fold function could not produce a document.
#[derive(Debug, Error)]
pub enum FoldError {
    /// The handler needs an existing document and there is none.
    #[error("no existing document to apply the event to")]
    MissingDocument,

    /// The decoded payload was not of the type the handler was registered for.
    #[error("unexpected payload type for {0}")]
    UnexpectedPayload(String),

    /// The fold rejected the transition.
    #[error("{0}")]
    Rejected(String),
}

impl FoldError {
    /// Creates a rejection with a message.
    pub fn rejected(reason: impl Into<String>) -> Self {
        FoldError::Rejected(reason.into())
    }
}

/// Errors that can occur during projection registration and processing.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// A projection for this document type is already registered.
    #[error("Duplicate projection for document type {0}")]
    DuplicateProjection(&'static str),

    /// A fold function failed; nothing from the enclosing apply is kept.
    #[error(
        "Projection {document_type} failed to fold {event_type} at version {sequence}: {source}"
    )]
    Fold {
        document_type: &'static str,
        event_type: String,
        sequence: Version,
        #[source]
        source: FoldError,
    },

    /// The events handed to the engine are not a contiguous batch of one stream.
    #[error("Invalid event batch: {0}")]
    InvalidBatch(String),

    /// A stored event could not be decoded.
    #[error("Event decode error: {0}")]
    Decode(#[from] DecodeError),

    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to (de)serialize a document or event payload.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProjectionError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProjectionError::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
