use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::change_set::check_expected_log;
use crate::{
    ChangeSet, CommitReceipt, DocumentKey, DocumentMutation, EventEnvelope, Result, StoreError,
    StoredDocument, StreamId, Version,
    store::{
        AppendOptions, CommitStore, DocumentStore, EventStore, EventStream,
        validate_events_for_append,
    },
};

#[derive(Default)]
struct Inner {
    /// Every event in append order.
    events: Vec<EventEnvelope>,
    documents: HashMap<DocumentKey, StoredDocument>,
}

impl Inner {
    fn stream_version(&self, stream_id: StreamId) -> Version {
        self.events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| e.version)
            .max()
            .unwrap_or(Version::initial())
    }

    fn stream_versions(&self) -> HashMap<StreamId, Version> {
        let mut versions = HashMap::new();
        for event in &self.events {
            versions.insert(event.stream_id, event.version);
        }
        versions
    }
}

/// Checks an append against the stream's current version.
fn check_append(
    stream_id: StreamId,
    events: &[EventEnvelope],
    options: AppendOptions,
    current_version: Version,
) -> Result<()> {
    validate_events_for_append(stream_id, events)?;

    if let Some(expected) = options.expected_version
        && current_version != expected
    {
        return Err(StoreError::ConcurrencyConflict {
            stream_id,
            expected,
            actual: current_version,
        });
    }

    // Unique (stream, version) constraint simulation
    let first_new_version = events[0].version;
    if first_new_version <= current_version {
        return Err(StoreError::ConcurrencyConflict {
            stream_id,
            expected: options.expected_version.unwrap_or(current_version),
            actual: current_version,
        });
    }
    if first_new_version != current_version.next() {
        return Err(StoreError::InvalidAppend(format!(
            "Stream {stream_id} is at version {current_version}, \
             cannot append at {first_new_version}"
        )));
    }

    Ok(())
}

/// In-memory store for tests and demos.
///
/// Events and documents sit behind a single lock, so a commit is observed by
/// readers either completely or not at all.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Returns the total number of documents stored.
    pub async fn document_count(&self) -> usize {
        self.inner.read().await.documents.len()
    }

    /// Clears all events and documents.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.events.clear();
        inner.documents.clear();
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append(
        &self,
        stream_id: StreamId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version> {
        let mut inner = self.inner.write().await;
        let current_version = inner.stream_version(stream_id);
        check_append(stream_id, &events, options, current_version)?;

        let last_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(current_version);
        metrics::counter!("store_events_appended").increment(events.len() as u64);
        inner.events.extend(events);

        Ok(last_version)
    }

    async fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let inner = self.inner.read().await;
        let mut events: Vec<_> = inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id && e.version >= from_version)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn stream_version(&self, stream_id: StreamId) -> Result<Option<Version>> {
        let inner = self.inner.read().await;
        let version = inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| e.version)
            .max();
        Ok(version)
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::stream;

        let events = self.inner.read().await.events.clone();
        let stream = stream::iter(events.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, document_type: &str, id: StreamId) -> Result<Option<StoredDocument>> {
        let inner = self.inner.read().await;
        Ok(inner
            .documents
            .get(&DocumentKey::new(document_type, id))
            .cloned())
    }

    async fn get_all(&self, id: StreamId) -> Result<Vec<StoredDocument>> {
        let inner = self.inner.read().await;
        let mut documents: Vec<_> = inner
            .documents
            .values()
            .filter(|d| d.id == id)
            .cloned()
            .collect();
        documents.sort_by(|a, b| a.document_type.cmp(&b.document_type));
        Ok(documents)
    }

    async fn list(&self, document_type: &str) -> Result<Vec<StoredDocument>> {
        let inner = self.inner.read().await;
        let mut documents: Vec<_> = inner
            .documents
            .values()
            .filter(|d| d.document_type == document_type)
            .cloned()
            .collect();
        documents.sort_by_key(|d| d.id);
        Ok(documents)
    }

    async fn upsert(&self, document: StoredDocument) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.documents.insert(document.key(), document);
        Ok(())
    }

    async fn delete(&self, document_type: &str, id: StreamId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.documents.remove(&DocumentKey::new(document_type, id));
        Ok(())
    }
}

#[async_trait]
impl CommitStore for InMemoryStore {
    #[tracing::instrument(
        skip_all,
        fields(events = changes.event_count(), documents = changes.mutations().len())
    )]
    async fn commit(&self, changes: ChangeSet) -> Result<CommitReceipt> {
        let mut inner = self.inner.write().await;

        if let Some(expected) = changes.expected_log()
            && let Err(err) = check_expected_log(expected, &inner.stream_versions())
        {
            metrics::counter!("store_concurrency_conflicts").increment(1);
            return Err(err);
        }

        let (appends, mutations) = changes.into_parts();

        // Validate every append before touching anything.
        let mut versions: HashMap<StreamId, Version> = HashMap::new();
        for append in &appends {
            let current = match versions.get(&append.stream_id) {
                Some(version) => *version,
                None => inner.stream_version(append.stream_id),
            };
            if let Err(err) =
                check_append(append.stream_id, &append.events, append.options, current)
            {
                if matches!(err, StoreError::ConcurrencyConflict { .. }) {
                    metrics::counter!("store_concurrency_conflicts").increment(1);
                }
                return Err(err);
            }
            if let Some(last) = append.last_version() {
                versions.insert(append.stream_id, last);
            }
        }

        let mut receipt = CommitReceipt {
            stream_versions: versions,
            ..CommitReceipt::default()
        };

        for append in appends {
            receipt.events_appended += append.events.len();
            inner.events.extend(append.events);
        }

        for mutation in mutations {
            match mutation {
                DocumentMutation::Upsert(document) => {
                    receipt.documents_upserted += 1;
                    inner.documents.insert(document.key(), document);
                }
                DocumentMutation::Delete(key) => {
                    receipt.documents_deleted += 1;
                    inner.documents.remove(&key);
                }
            }
        }

        metrics::counter!("store_commits").increment(1);
        metrics::counter!("store_events_appended").increment(receipt.events_appended as u64);
        tracing::debug!(
            events = receipt.events_appended,
            upserted = receipt.documents_upserted,
            deleted = receipt.documents_deleted,
            "commit applied"
        );

        Ok(receipt)
    }
}
