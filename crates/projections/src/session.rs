//! Document sessions: the unit of work callers append events through.

use std::sync::Arc;
use std::time::Instant;

use store::{
    AppendOptions, ChangeSet, CommitReceipt, CommitStore, Document, DocumentKey,
    DocumentMutation, DocumentStore, DocumentStoreExt, Event, EventStore, NewEvent, StoreError,
    StoredDocument, StreamId, UnitOfWork, Version,
};

use crate::engine::AggregationEngine;
use crate::registry::ProjectionRegistry;
use crate::Result;

struct PendingStream {
    stream_id: StreamId,
    expected: Option<Version>,
    events: Vec<NewEvent>,
}

/// Stages appends and document writes and commits them as one unit.
///
/// On [`commit`](Self::commit) every stream's new events are run through the
/// inline projections, and the events, the resulting document mutations and
/// any documents written explicitly are committed atomically. A session is
/// consumed by `commit` or [`rollback`](Self::rollback); dropping it with
/// staged changes discards them.
///
/// Explicit writes are staged before projection output, so a projection that
/// touches the same document wins.
pub struct DocumentSession<S: CommitStore> {
    store: Arc<S>,
    engine: AggregationEngine,
    pending: Vec<PendingStream>,
    documents: Vec<DocumentMutation>,
}

impl<S: CommitStore> DocumentSession<S> {
    pub fn new(store: Arc<S>, engine: AggregationEngine) -> Self {
        Self {
            store,
            engine,
            pending: Vec::new(),
            documents: Vec::new(),
        }
    }

    fn stream_mut(&mut self, stream_id: StreamId) -> &mut PendingStream {
        let index = match self.pending.iter().position(|p| p.stream_id == stream_id) {
            Some(index) => index,
            None => {
                self.pending.push(PendingStream {
                    stream_id,
                    expected: None,
                    events: Vec::new(),
                });
                self.pending.len() - 1
            }
        };
        &mut self.pending[index]
    }

    /// Stages `event` for `stream_id`. Versions are assigned at commit.
    pub fn append<E: Event>(&mut self, stream_id: StreamId, event: &E) -> Result<()> {
        let event = NewEvent::new(event)?;
        self.append_raw(stream_id, event);
        Ok(())
    }

    /// Stages an already serialized event.
    pub fn append_raw(&mut self, stream_id: StreamId, event: NewEvent) {
        self.stream_mut(stream_id).events.push(event);
    }

    /// Stages the first event of a new stream; the commit fails if the stream
    /// already exists.
    pub fn start_stream<E: Event>(&mut self, stream_id: StreamId, event: &E) -> Result<()> {
        self.stream_mut(stream_id).expected = Some(Version::initial());
        self.append(stream_id, event)
    }

    /// Stages `event`, requiring `stream_id` to be at `expected` when committed.
    pub fn append_expected<E: Event>(
        &mut self,
        stream_id: StreamId,
        expected: Version,
        event: &E,
    ) -> Result<()> {
        self.stream_mut(stream_id).expected = Some(expected);
        self.append(stream_id, event)
    }

    /// Stages an explicit write of a document.
    pub fn store<D: Document>(&mut self, id: StreamId, document: &D) -> Result<()> {
        let version = Version::initial();
        let stored = StoredDocument::from_document(id, version, document)?;
        self.stage(DocumentMutation::Upsert(stored));
        Ok(())
    }

    /// Stages an explicit delete of the `D` document for `id`.
    pub fn delete<D: Document>(&mut self, id: StreamId) {
        self.stage(DocumentMutation::Delete(DocumentKey::of::<D>(id)));
    }

    fn stage(&mut self, mutation: DocumentMutation) {
        let key = mutation.key();
        self.documents.retain(|m| m.key() != key);
        self.documents.push(mutation);
    }

    /// Number of events staged across all streams.
    pub fn pending_events(&self) -> usize {
        self.pending.iter().map(|p| p.events.len()).sum()
    }

    pub fn has_changes(&self) -> bool {
        self.pending_events() > 0 || !self.documents.is_empty()
    }

    /// Loads the committed `D` document for `id`. Staged changes are not visible.
    pub async fn load<D: Document>(&self, id: StreamId) -> Result<Option<D>> {
        Ok(self.store.load::<D>(id).await?)
    }

    /// Loads every committed document stored under `id`, whatever its kind.
    pub async fn load_all(&self, id: StreamId) -> Result<Vec<StoredDocument>> {
        Ok(self.store.get_all(id).await?)
    }

    /// Runs the inline projections and commits everything staged.
    ///
    /// Fails without writing anything if a projection fails, if a stream is
    /// not at its expected version, or if the store rejects the commit.
    #[tracing::instrument(
        skip_all,
        fields(events = self.pending_events(), documents = self.documents.len())
    )]
    pub async fn commit(mut self) -> Result<CommitReceipt> {
        let pending = std::mem::take(&mut self.pending);
        let documents = std::mem::take(&mut self.documents);
        let started = Instant::now();

        let mut changes = ChangeSet::new();
        let mut projected_upserts = 0u64;
        let mut projected_deletes = 0u64;
        for mutation in documents {
            changes.stage_document_mutation(mutation);
        }

        for stream in pending {
            if stream.events.is_empty() {
                continue;
            }
            let stream_id = stream.stream_id;
            let current = self
                .store
                .stream_version(stream_id)
                .await?
                .unwrap_or_else(Version::initial);

            if let Some(expected) = stream.expected
                && expected != current
            {
                metrics::counter!("store_concurrency_conflicts").increment(1);
                return Err(StoreError::ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual: current,
                }
                .into());
            }

            let mut version = current;
            let events: Vec<_> = stream
                .events
                .into_iter()
                .map(|event| {
                    version = version.next();
                    event.into_envelope(stream_id, version)
                })
                .collect();

            let decoder = self.engine.registry().decoder();
            for event in events.iter().filter(|e| !decoder.is_known(&e.event_type)) {
                tracing::warn!(
                    event_type = %event.event_type,
                    %stream_id,
                    "appending event of unregistered type"
                );
            }

            let mutations = self
                .engine
                .apply(stream_id, &events, self.store.as_ref())
                .await?;
            for mutation in mutations {
                match mutation {
                    DocumentMutation::Upsert(_) => projected_upserts += 1,
                    DocumentMutation::Delete(_) => projected_deletes += 1,
                }
                changes.stage_document_mutation(mutation);
            }
            changes.stage_append(stream_id, AppendOptions::expect_version(current), events);
        }

        if changes.is_empty() {
            return Ok(CommitReceipt::default());
        }

        let receipt = self.store.commit(changes).await?;

        metrics::counter!("projections_documents_upserted").increment(projected_upserts);
        metrics::counter!("projections_documents_deleted").increment(projected_deletes);
        metrics::histogram!("session_commit_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::debug!(
            events = receipt.events_appended,
            upserted = receipt.documents_upserted,
            deleted = receipt.documents_deleted,
            "session committed"
        );

        Ok(receipt)
    }

    /// Discards everything staged.
    pub fn rollback(mut self) {
        let discarded = self.pending_events();
        self.pending.clear();
        self.documents.clear();
        tracing::debug!(events = discarded, "session rolled back");
    }
}

impl<S: CommitStore> Drop for DocumentSession<S> {
    fn drop(&mut self) {
        if self.has_changes() {
            tracing::warn!(
                events = self.pending_events(),
                documents = self.documents.len(),
                "session dropped with uncommitted changes"
            );
        }
    }
}

/// Opens sessions against a shared store and projection registry.
pub struct SessionFactory<S: CommitStore> {
    store: Arc<S>,
    engine: AggregationEngine,
}

impl<S: CommitStore> Clone for SessionFactory<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            engine: self.engine.clone(),
        }
    }
}

impl<S: CommitStore> SessionFactory<S> {
    pub fn new(store: S, registry: ProjectionRegistry) -> Self {
        Self {
            store: Arc::new(store),
            engine: AggregationEngine::new(Arc::new(registry)),
        }
    }

    pub fn open_session(&self) -> DocumentSession<S> {
        DocumentSession::new(Arc::clone(&self.store), self.engine.clone())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }
}
