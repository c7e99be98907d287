//! Rebuilding inline projections from the event log.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures_util::StreamExt;
use store::{
    ChangeSet, CommitStore, DocumentKey, DocumentMutation, DocumentStore, EventEnvelope,
    EventStore, StoredDocument, StreamId, UnitOfWork, Version,
};

use crate::Result;
use crate::engine::AggregationEngine;

/// Outcome of [`rebuild_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub streams: usize,
    pub events: usize,
    pub documents_upserted: usize,
    pub documents_deleted: usize,
}

/// A document store with nothing in it, so every stream folds from scratch.
struct NoDocuments;

#[async_trait]
impl DocumentStore for NoDocuments {
    async fn get(
        &self,
        _document_type: &str,
        _id: StreamId,
    ) -> store::Result<Option<StoredDocument>> {
        Ok(None)
    }

    async fn get_all(&self, _id: StreamId) -> store::Result<Vec<StoredDocument>> {
        Ok(Vec::new())
    }

    async fn list(&self, _document_type: &str) -> store::Result<Vec<StoredDocument>> {
        Ok(Vec::new())
    }

    async fn upsert(&self, _document: StoredDocument) -> store::Result<()> {
        Ok(())
    }

    async fn delete(&self, _document_type: &str, _id: StreamId) -> store::Result<()> {
        Ok(())
    }
}

/// Recomputes every document maintained by the engine's projections.
///
/// Each stream in the log is replayed from its first event with no prior
/// documents, and the results replace what is stored. Documents of a
/// registered type that the replay does not produce are deleted. Everything is
/// written in a single commit, so readers see either the old or the rebuilt
/// documents.
///
/// The commit requires the log to be exactly as it was read. If any stream
/// was appended to in the meantime, the rebuild fails with
/// [`StoreError::ConcurrencyConflict`](store::StoreError::ConcurrencyConflict)
/// and writes nothing.
#[tracing::instrument(skip_all)]
pub async fn rebuild_all<S>(store: &S, engine: &AggregationEngine) -> Result<RebuildReport>
where
    S: CommitStore + ?Sized,
{
    let mut streams: Vec<(StreamId, Vec<EventEnvelope>)> = Vec::new();
    let mut index: HashMap<StreamId, usize> = HashMap::new();
    let mut tails: HashMap<StreamId, Version> = HashMap::new();
    let mut events = store.stream_all_events().await?;
    let mut event_count = 0;

    while let Some(event) = events.next().await {
        let event = event?;
        event_count += 1;
        tails.insert(event.stream_id, event.version);
        let slot = *index.entry(event.stream_id).or_insert_with(|| {
            streams.push((event.stream_id, Vec::new()));
            streams.len() - 1
        });
        streams[slot].1.push(event);
    }

    let mut changes = ChangeSet::new();
    changes.expect_log(tails);
    let mut rebuilt: HashSet<DocumentKey> = HashSet::new();

    for (stream_id, stream_events) in &streams {
        for mutation in engine.apply(*stream_id, stream_events, &NoDocuments).await? {
            if let DocumentMutation::Upsert(document) = &mutation {
                rebuilt.insert(document.key());
            }
            changes.stage_document_mutation(mutation);
        }
    }

    for document_type in engine.registry().document_types() {
        for existing in store.list(document_type).await? {
            let key = existing.key();
            if !rebuilt.contains(&key) {
                changes.stage_document_mutation(DocumentMutation::Delete(key));
            }
        }
    }

    let receipt = store.commit(changes).await?;
    metrics::counter!("projections_documents_upserted")
        .increment(receipt.documents_upserted as u64);
    metrics::counter!("projections_documents_deleted")
        .increment(receipt.documents_deleted as u64);

    let report = RebuildReport {
        streams: streams.len(),
        events: event_count,
        documents_upserted: receipt.documents_upserted,
        documents_deleted: receipt.documents_deleted,
    };

    tracing::info!(
        streams = report.streams,
        events = report.events,
        upserted = report.documents_upserted,
        deleted = report.documents_deleted,
        "projections rebuilt"
    );

    Ok(report)
}
