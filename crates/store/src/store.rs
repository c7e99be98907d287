use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{
    ChangeSet, CommitReceipt, Document, EventEnvelope, Result, StoreError, StoredDocument,
    StreamId, Version,
};

/// Options for appending events to a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOptions {
    /// Expected version of the stream for optimistic concurrency control.
    /// If None, no version check is performed (use with caution).
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the stream to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the stream to not exist yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// A stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Append-only log of events keyed by stream.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events to a stream.
    ///
    /// Events are appended atomically - either all succeed or none do.
    /// If `options.expected_version` is set, the operation will fail with
    /// `ConcurrencyConflict` if the current version doesn't match.
    ///
    /// Returns the new version of the stream after appending.
    async fn append(
        &self,
        stream_id: StreamId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version>;

    /// Retrieves the events of a stream starting at `from_version` (inclusive),
    /// in version order.
    async fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>>;

    /// Gets the current version of a stream.
    ///
    /// Returns None if the stream has no events.
    async fn stream_version(&self, stream_id: StreamId) -> Result<Option<Version>>;

    /// Streams every event in the store in append order.
    async fn stream_all_events(&self) -> Result<EventStream>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Reads a stream from its first event.
    async fn read_full_stream(&self, stream_id: StreamId) -> Result<Vec<EventEnvelope>> {
        self.read_stream(stream_id, Version::first()).await
    }

    /// Checks if a stream exists (has any events).
    async fn stream_exists(&self, stream_id: StreamId) -> Result<bool> {
        Ok(self.stream_version(stream_id).await?.is_some())
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Persists materialized documents keyed by (document type, id).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Loads one document, or None if it does not exist.
    async fn get(&self, document_type: &str, id: StreamId) -> Result<Option<StoredDocument>>;

    /// Loads every document stored under `id`, whatever its kind.
    async fn get_all(&self, id: StreamId) -> Result<Vec<StoredDocument>>;

    /// Loads every document of one kind.
    async fn list(&self, document_type: &str) -> Result<Vec<StoredDocument>>;

    /// Inserts or replaces a document.
    async fn upsert(&self, document: StoredDocument) -> Result<()>;

    /// Deletes a document. Deleting a missing document is not an error.
    async fn delete(&self, document_type: &str, id: StreamId) -> Result<()>;
}

/// Typed helpers over [`DocumentStore`].
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    /// Loads and deserializes the `D` document for `id`.
    async fn load<D: Document>(&self, id: StreamId) -> Result<Option<D>> {
        match self.get(D::DOCUMENT_TYPE, id).await? {
            Some(document) => Ok(Some(document.into_document()?)),
            None => Ok(None),
        }
    }
}

impl<T: DocumentStore + ?Sized> DocumentStoreExt for T {}

/// A store that can commit appends and document mutations as one atomic unit.
#[async_trait]
pub trait CommitStore: EventStore + DocumentStore {
    /// Commits every append and mutation in `changes`, or none of them.
    ///
    /// Fails with `ConcurrencyConflict` if any append's expected version no
    /// longer matches, and with `Commit` if the storage write itself fails.
    async fn commit(&self, changes: ChangeSet) -> Result<CommitReceipt>;
}

/// Validates events before appending them to `stream_id`.
///
/// Events must be non-empty, belong to `stream_id`, and carry contiguous,
/// ascending versions.
pub fn validate_events_for_append(stream_id: StreamId, events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(StoreError::InvalidAppend(
            "Cannot append empty event list".to_string(),
        ));
    };

    if events.iter().any(|e| e.stream_id != stream_id) {
        return Err(StoreError::InvalidAppend(format!(
            "All events must belong to stream {stream_id}"
        )));
    }

    // Versions must be sequential
    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(StoreError::InvalidAppend(format!(
                "Event versions must be sequential. Expected {}, got {}",
                expected_version, event.version
            )));
        }
    }

    Ok(())
}
