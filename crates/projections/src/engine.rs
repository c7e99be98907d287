//! Inline aggregation: folds a stream's new events into document mutations.

use std::sync::Arc;
use std::time::Instant;

use store::{
    DecodedEvent, DocumentMutation, DocumentStore, EventEnvelope, StreamId,
    store::validate_events_for_append,
};

use crate::registry::ProjectionRegistry;
use crate::{ProjectionError, Result};

/// Applies registered projections to batches of events from one stream.
///
/// For every projection that handles at least one event in the batch, the
/// engine loads the current document once, folds the matching events in
/// ascending version order, and produces one net mutation. Projections with no
/// matching events are not touched: nothing is loaded and nothing is written.
///
/// A failure in any projection fails the whole batch and no mutation is
/// returned.
#[derive(Clone)]
pub struct AggregationEngine {
    registry: Arc<ProjectionRegistry>,
}

impl AggregationEngine {
    pub fn new(registry: Arc<ProjectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProjectionRegistry {
        &self.registry
    }

    /// Folds `events` into one mutation per touched document.
    ///
    /// `events` must belong to `stream_id` and have contiguous, ascending
    /// versions. Existing documents are read from `documents`. Mutations are
    /// returned in projection registration order.
    #[tracing::instrument(skip(self, events, documents), fields(events = events.len()))]
    pub async fn apply<R>(
        &self,
        stream_id: StreamId,
        events: &[EventEnvelope],
        documents: &R,
    ) -> Result<Vec<DocumentMutation>>
    where
        R: DocumentStore + ?Sized,
    {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        validate_events_for_append(stream_id, events)
            .map_err(|e| ProjectionError::InvalidBatch(e.to_string()))?;

        let started = Instant::now();

        // Only events some projection handles are decoded; the rest pass through.
        let decoded = events
            .iter()
            .filter(|e| self.registry.handles(&e.event_type))
            .map(|e| self.registry.decoder().decode(e))
            .collect::<std::result::Result<Vec<DecodedEvent<'_>>, _>>()?;

        let mut mutations = Vec::new();
        for projection in self.registry.projections() {
            let matching: Vec<&DecodedEvent<'_>> = decoded
                .iter()
                .filter(|e| projection.handler_kind(e.event_type()).is_some())
                .collect();
            if matching.is_empty() {
                continue;
            }

            let document_type = projection.document_type();
            let current = documents.get(document_type, stream_id).await?;

            let mutation = projection
                .fold_batch(stream_id, current, &matching)
                .inspect_err(|err| {
                    metrics::counter!("projections_fold_failures").increment(1);
                    tracing::warn!(document_type, error = %err, "projection failed");
                })?;

            match mutation {
                Some(mutation) => {
                    tracing::debug!(
                        document_type,
                        delete = mutation.is_delete(),
                        events = matching.len(),
                        "document mutation produced"
                    );
                    mutations.push(mutation);
                }
                None => {
                    tracing::trace!(document_type, "projection produced no change");
                }
            }
        }

        metrics::histogram!("projections_apply_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        Ok(mutations)
    }
}

impl std::fmt::Debug for AggregationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationEngine")
            .field("registry", &self.registry)
            .finish()
    }
}
