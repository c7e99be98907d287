//! Unit-of-work staging.

use std::collections::HashMap;

use crate::{
    AppendOptions, DocumentMutation, EventEnvelope, Result, StoreError, StreamId, Version,
};

/// Staging surface of a unit of work.
///
/// Producers of writes (sessions, the aggregation engine) only stage; the
/// owner of the unit of work decides when to commit.
pub trait UnitOfWork {
    /// Stages events to append to `stream_id`.
    fn stage_append(
        &mut self,
        stream_id: StreamId,
        options: AppendOptions,
        events: Vec<EventEnvelope>,
    );

    /// Stages a document write. A later mutation of the same key replaces an
    /// earlier one.
    fn stage_document_mutation(&mut self, mutation: DocumentMutation);
}

/// Events staged for one stream.
#[derive(Debug, Clone)]
pub struct StreamAppend {
    pub stream_id: StreamId,
    pub options: AppendOptions,
    pub events: Vec<EventEnvelope>,
}

impl StreamAppend {
    /// Version of the stream once this append is committed.
    pub fn last_version(&self) -> Option<Version> {
        self.events.last().map(|e| e.version)
    }
}

/// Everything a single atomic commit will write.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    appends: Vec<StreamAppend>,
    mutations: Vec<DocumentMutation>,
    expected_log: Option<HashMap<StreamId, Version>>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires the whole event log to still hold exactly these streams at
    /// these versions when the commit runs.
    ///
    /// The commit fails with [`StoreError::ConcurrencyConflict`] if any stream
    /// moved or a stream not listed here exists.
    pub fn expect_log(&mut self, stream_versions: HashMap<StreamId, Version>) {
        self.expected_log = Some(stream_versions);
    }

    pub fn expected_log(&self) -> Option<&HashMap<StreamId, Version>> {
        self.expected_log.as_ref()
    }

    /// Staged document writes, one per key, in staging order.
    pub fn mutations(&self) -> &[DocumentMutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.appends.is_empty() && self.mutations.is_empty()
    }

    /// Total number of staged events across all streams.
    pub fn event_count(&self) -> usize {
        self.appends.iter().map(|a| a.events.len()).sum()
    }

    pub fn into_parts(self) -> (Vec<StreamAppend>, Vec<DocumentMutation>) {
        (self.appends, self.mutations)
    }
}

impl UnitOfWork for ChangeSet {
    fn stage_append(
        &mut self,
        stream_id: StreamId,
        options: AppendOptions,
        events: Vec<EventEnvelope>,
    ) {
        if events.is_empty() {
            return;
        }
        self.appends.push(StreamAppend {
            stream_id,
            options,
            events,
        });
    }

    fn stage_document_mutation(&mut self, mutation: DocumentMutation) {
        let key = mutation.key();
        match self.mutations.iter_mut().find(|m| m.key() == key) {
            Some(existing) => *existing = mutation,
            None => self.mutations.push(mutation),
        }
    }
}

/// Compares the log a commit expects against the store's current stream
/// versions.
pub fn check_expected_log(
    expected: &HashMap<StreamId, Version>,
    actual: &HashMap<StreamId, Version>,
) -> Result<()> {
    let version_in = |versions: &HashMap<StreamId, Version>, id: &StreamId| {
        versions.get(id).copied().unwrap_or_else(Version::initial)
    };

    let moved = actual
        .keys()
        .chain(expected.keys())
        .find(|id| version_in(expected, id) != version_in(actual, id));

    match moved {
        Some(&stream_id) => Err(StoreError::ConcurrencyConflict {
            stream_id,
            expected: version_in(expected, &stream_id),
            actual: version_in(actual, &stream_id),
        }),
        None => Ok(()),
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// New version of every stream appended to.
    pub stream_versions: HashMap<StreamId, Version>,
    pub events_appended: usize,
    pub documents_upserted: usize,
    pub documents_deleted: usize,
}

impl CommitReceipt {
    /// New version of `stream_id`, if it was appended to.
    pub fn version_of(&self, stream_id: StreamId) -> Option<Version> {
        self.stream_versions.get(&stream_id).copied()
    }
}
