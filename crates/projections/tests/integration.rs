//! Integration tests: sessions → aggregation engine → in-memory store.
//!
//! A small membership domain exercises the engine's guarantees: batching does
//! not change the outcome, deletes win over earlier writes, untouched documents
//! are never read or written, and a single failing fold aborts everything.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use projections::{
    AggregationEngine, FoldError, ProjectionDefinition, ProjectionError, ProjectionRegistry,
    SessionFactory, rebuild_all,
};
use serde::{Deserialize, Serialize};
use store::{
    AppendOptions, ChangeSet, CommitReceipt, CommitStore, Document, DocumentStore,
    DocumentStoreExt, Event, EventEnvelope, EventStore, EventStoreExt, EventStream, InMemoryStore,
    StoreError, StoredDocument, StreamId, Version,
};

#[derive(Debug, Serialize, Deserialize)]
struct MemberJoined {
    name: String,
}
impl Event for MemberJoined {
    const EVENT_TYPE: &'static str = "MemberJoined";
}

#[derive(Debug, Serialize, Deserialize)]
struct PointsEarned {
    points: u32,
}
impl Event for PointsEarned {
    const EVENT_TYPE: &'static str = "PointsEarned";
}

#[derive(Debug, Serialize, Deserialize)]
struct MemberLeft {
    reason: String,
}
impl Event for MemberLeft {
    const EVENT_TYPE: &'static str = "MemberLeft";
}

#[derive(Debug, Serialize, Deserialize)]
struct AddressChanged {
    city: String,
}
impl Event for AddressChanged {
    const EVENT_TYPE: &'static str = "AddressChanged";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Member {
    name: String,
    points: u32,
}
impl Document for Member {
    const DOCUMENT_TYPE: &'static str = "Member";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FormerMember {
    reason: String,
}
impl Document for FormerMember {
    const DOCUMENT_TYPE: &'static str = "FormerMember";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MailingAddress {
    city: String,
}
impl Document for MailingAddress {
    const DOCUMENT_TYPE: &'static str = "MailingAddress";
}

fn registry() -> ProjectionRegistry {
    let mut registry = ProjectionRegistry::new();
    registry
        .register(
            ProjectionDefinition::<Member>::new()
                .create(|e: &MemberJoined, _| Member {
                    name: e.name.clone(),
                    points: 0,
                })
                .apply(|mut member, e: &PointsEarned, _| {
                    member.points += e.points;
                    member
                })
                .delete_on::<MemberLeft>(),
        )
        .unwrap();
    registry
        .register(
            ProjectionDefinition::<FormerMember>::new()
                .create(|e: &MemberLeft, _| FormerMember {
                    reason: e.reason.clone(),
                })
                .delete_on::<MemberJoined>(),
        )
        .unwrap();
    registry
        .register(ProjectionDefinition::<MailingAddress>::new().fold(
            |_: Option<MailingAddress>, e: &AddressChanged, _| {
                if e.city.is_empty() {
                    return Err(FoldError::rejected("city must not be empty"));
                }
                Ok(MailingAddress {
                    city: e.city.clone(),
                })
            },
        ))
        .unwrap();
    registry
}

fn factory() -> SessionFactory<InMemoryStore> {
    SessionFactory::new(InMemoryStore::new(), registry())
}

enum Step {
    Join(&'static str),
    Earn(u32),
    Leave(&'static str),
    Move(&'static str),
}

fn stage(session: &mut projections::DocumentSession<InMemoryStore>, id: StreamId, step: &Step) {
    let staged = match step {
        Step::Join(name) => session.append(id, &MemberJoined { name: name.to_string() }),
        Step::Earn(points) => session.append(id, &PointsEarned { points: *points }),
        Step::Leave(reason) => session.append(id, &MemberLeft { reason: reason.to_string() }),
        Step::Move(city) => session.append(id, &AddressChanged { city: city.to_string() }),
    };
    staged.unwrap();
}

/// Commits `steps` split into sessions of the given sizes and returns every
/// document stored for the stream, data only.
async fn run_in_batches(
    steps: &[Step],
    batch_sizes: &[usize],
) -> Vec<(String, serde_json::Value)> {
    let factory = factory();
    let id = StreamId::new();
    let mut remaining = steps;

    for size in batch_sizes {
        let (batch, rest) = remaining.split_at(*size);
        let mut session = factory.open_session();
        for step in batch {
            stage(&mut session, id, step);
        }
        session.commit().await.unwrap();
        remaining = rest;
    }
    assert!(remaining.is_empty());

    let mut documents: Vec<_> = factory
        .store()
        .get_all(id)
        .await
        .unwrap()
        .into_iter()
        .map(|d| (d.document_type, d.data))
        .collect();
    documents.sort_by(|a, b| a.0.cmp(&b.0));
    documents
}

#[tokio::test]
async fn batching_does_not_change_the_outcome() {
    let steps = [
        Step::Join("Jane"),
        Step::Earn(10),
        Step::Move("Lisbon"),
        Step::Leave("moved away"),
        Step::Join("Jane"),
        Step::Earn(5),
    ];

    let one_session = run_in_batches(&steps, &[6]).await;
    let one_per_event = run_in_batches(&steps, &[1, 1, 1, 1, 1, 1]).await;
    let uneven = run_in_batches(&steps, &[2, 3, 1]).await;

    assert_eq!(one_session, one_per_event);
    assert_eq!(one_session, uneven);

    let kinds: Vec<_> = one_session.iter().map(|(kind, _)| kind.as_str()).collect();
    assert_eq!(kinds, vec!["MailingAddress", "Member"]);
    assert_eq!(one_session[1].1["points"], 5);
}

#[tokio::test]
async fn delete_leaves_document_absent() {
    let factory = factory();
    let id = StreamId::new();

    let mut session = factory.open_session();
    session.append(id, &MemberJoined { name: "Jane".into() }).unwrap();
    session.commit().await.unwrap();
    assert!(factory.store().load::<Member>(id).await.unwrap().is_some());

    let mut session = factory.open_session();
    session.append(id, &MemberLeft { reason: "done".into() }).unwrap();
    session.commit().await.unwrap();

    assert!(factory.store().load::<Member>(id).await.unwrap().is_none());
    let former = factory.store().load::<FormerMember>(id).await.unwrap().unwrap();
    assert_eq!(former.reason, "done");
}

#[tokio::test]
async fn create_then_delete_in_one_batch_never_writes_the_document() {
    let store = InMemoryStore::new();
    let engine = AggregationEngine::new(Arc::new(registry()));
    let id = StreamId::new();
    let events = vec![
        envelope(id, 1, &MemberJoined { name: "Jane".into() }),
        envelope(id, 2, &PointsEarned { points: 3 }),
        envelope(id, 3, &MemberLeft { reason: "changed mind".into() }),
    ];

    let mutations = engine.apply(id, &events, &store).await.unwrap();

    let member = mutations
        .iter()
        .find(|m| m.key().document_type == "Member")
        .unwrap();
    assert!(member.is_delete());
}

fn envelope<E: Event>(id: StreamId, version: i64, event: &E) -> EventEnvelope {
    EventEnvelope::builder()
        .stream_id(id)
        .version(Version::new(version))
        .event(event)
        .unwrap()
        .build()
}

/// Forwards to an [`InMemoryStore`], counting reads and writes by document type.
#[derive(Default)]
struct CountingStore {
    inner: InMemoryStore,
    reads: AtomicUsize,
    address_reads: AtomicUsize,
    writes: AtomicUsize,
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn get(
        &self,
        document_type: &str,
        id: StreamId,
    ) -> store::Result<Option<StoredDocument>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if document_type == MailingAddress::DOCUMENT_TYPE {
            self.address_reads.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.get(document_type, id).await
    }

    async fn get_all(&self, id: StreamId) -> store::Result<Vec<StoredDocument>> {
        self.inner.get_all(id).await
    }

    async fn list(&self, document_type: &str) -> store::Result<Vec<StoredDocument>> {
        self.inner.list(document_type).await
    }

    async fn upsert(&self, document: StoredDocument) -> store::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(document).await
    }

    async fn delete(&self, document_type: &str, id: StreamId) -> store::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(document_type, id).await
    }
}

#[tokio::test]
async fn projections_without_matching_events_are_not_touched() {
    let store = CountingStore::default();
    let engine = AggregationEngine::new(Arc::new(registry()));
    let id = StreamId::new();
    let events = vec![
        envelope(id, 1, &MemberJoined { name: "Jane".into() }),
        envelope(id, 2, &PointsEarned { points: 1 }),
    ];

    let mutations = engine.apply(id, &events, &store).await.unwrap();

    // Member and FormerMember handle MemberJoined; MailingAddress does not.
    assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    assert_eq!(store.address_reads.load(Ordering::SeqCst), 0);
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    assert!(mutations.iter().all(|m| m.key().document_type != "MailingAddress"));
}

#[tokio::test]
async fn one_failing_fold_aborts_every_projection() {
    let factory = factory();
    let id = StreamId::new();

    let mut session = factory.open_session();
    session.append(id, &MemberJoined { name: "Jane".into() }).unwrap();
    session.append(id, &AddressChanged { city: String::new() }).unwrap();
    let err = session.commit().await.unwrap_err();

    match err {
        ProjectionError::Fold {
            document_type,
            event_type,
            sequence,
            ..
        } => {
            assert_eq!(document_type, "MailingAddress");
            assert_eq!(event_type, "AddressChanged");
            assert_eq!(sequence, Version::new(2));
        }
        other => panic!("unexpected error {other:?}"),
    }

    // The Member projection folded fine, but nothing was committed.
    assert!(factory.store().load::<Member>(id).await.unwrap().is_none());
    assert!(!factory.store().stream_exists(id).await.unwrap());
}

#[tokio::test]
async fn apply_without_prior_document_fails() {
    let factory = factory();
    let id = StreamId::new();

    let mut session = factory.open_session();
    session.append(id, &PointsEarned { points: 1 }).unwrap();
    let err = session.commit().await.unwrap_err();

    assert!(matches!(
        err,
        ProjectionError::Fold {
            document_type: "Member",
            source: FoldError::MissingDocument,
            ..
        }
    ));
}

#[tokio::test]
async fn rebuild_recomputes_documents_from_the_log() {
    let factory = factory();
    let jane = StreamId::new();
    let joe = StreamId::new();

    let mut session = factory.open_session();
    session.append(jane, &MemberJoined { name: "Jane".into() }).unwrap();
    session.append(jane, &PointsEarned { points: 7 }).unwrap();
    session.append(joe, &MemberJoined { name: "Joe".into() }).unwrap();
    session.append(joe, &MemberLeft { reason: "moved".into() }).unwrap();
    session.commit().await.unwrap();

    let expected_jane = factory.store().load::<Member>(jane).await.unwrap();

    // Corrupt one document and leave a stray one behind.
    let store = factory.store();
    store
        .upsert(
            StoredDocument::from_document(jane, Version::new(2), &Member {
                name: "wrong".into(),
                points: 0,
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let stray = StreamId::new();
    store
        .upsert(
            StoredDocument::from_document(stray, Version::first(), &Member {
                name: "ghost".into(),
                points: 0,
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let report = rebuild_all(store, factory.engine()).await.unwrap();

    assert_eq!(report.streams, 2);
    assert_eq!(report.events, 4);
    assert_eq!(store.load::<Member>(jane).await.unwrap(), expected_jane);
    assert!(store.load::<Member>(stray).await.unwrap().is_none());
    assert!(store.load::<Member>(joe).await.unwrap().is_none());
    assert!(store.load::<FormerMember>(joe).await.unwrap().is_some());
}

#[tokio::test]
async fn events_appended_without_a_session_are_projected_by_rebuild() {
    let factory = factory();
    let id = StreamId::new();

    factory
        .store()
        .append(
            id,
            vec![
                envelope(id, 1, &MemberJoined { name: "Jane".into() }),
                envelope(id, 2, &PointsEarned { points: 2 }),
            ],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();
    assert!(factory.store().load::<Member>(id).await.unwrap().is_none());

    rebuild_all(factory.store(), factory.engine()).await.unwrap();

    let member = factory.store().load::<Member>(id).await.unwrap().unwrap();
    assert_eq!(member.points, 2);
}

/// Forwards to an [`InMemoryStore`]. The first time the whole log is read, a
/// member joins on a new stream through a regular session, after the read has
/// taken its snapshot.
struct LateJoinStore {
    inner: InMemoryStore,
    sessions: SessionFactory<InMemoryStore>,
    late: StreamId,
    joined: AtomicBool,
}

impl LateJoinStore {
    fn new() -> Self {
        let inner = InMemoryStore::new();
        Self {
            sessions: SessionFactory::new(inner.clone(), registry()),
            inner,
            late: StreamId::new(),
            joined: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventStore for LateJoinStore {
    async fn append(
        &self,
        stream_id: StreamId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> store::Result<Version> {
        self.inner.append(stream_id, events, options).await
    }

    async fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> store::Result<Vec<EventEnvelope>> {
        self.inner.read_stream(stream_id, from_version).await
    }

    async fn stream_version(&self, stream_id: StreamId) -> store::Result<Option<Version>> {
        self.inner.stream_version(stream_id).await
    }

    async fn stream_all_events(&self) -> store::Result<EventStream> {
        let events = self.inner.stream_all_events().await?;
        if !self.joined.swap(true, Ordering::SeqCst) {
            let mut session = self.sessions.open_session();
            session
                .append(self.late, &MemberJoined { name: "Late".into() })
                .unwrap();
            session.commit().await.unwrap();
        }
        Ok(events)
    }
}

#[async_trait]
impl DocumentStore for LateJoinStore {
    async fn get(
        &self,
        document_type: &str,
        id: StreamId,
    ) -> store::Result<Option<StoredDocument>> {
        self.inner.get(document_type, id).await
    }

    async fn get_all(&self, id: StreamId) -> store::Result<Vec<StoredDocument>> {
        self.inner.get_all(id).await
    }

    async fn list(&self, document_type: &str) -> store::Result<Vec<StoredDocument>> {
        self.inner.list(document_type).await
    }

    async fn upsert(&self, document: StoredDocument) -> store::Result<()> {
        self.inner.upsert(document).await
    }

    async fn delete(&self, document_type: &str, id: StreamId) -> store::Result<()> {
        self.inner.delete(document_type, id).await
    }
}

#[async_trait]
impl CommitStore for LateJoinStore {
    async fn commit(&self, changes: ChangeSet) -> store::Result<CommitReceipt> {
        self.inner.commit(changes).await
    }
}

#[tokio::test]
async fn rebuild_fails_when_a_stream_is_written_during_the_replay() {
    let store = LateJoinStore::new();
    let engine = AggregationEngine::new(Arc::new(registry()));

    let err = rebuild_all(&store, &engine).await.unwrap_err();

    assert!(matches!(
        err,
        ProjectionError::Store(StoreError::ConcurrencyConflict { stream_id, .. })
            if stream_id == store.late
    ));
    let member = store.inner.load::<Member>(store.late).await.unwrap().unwrap();
    assert_eq!(member.name, "Late");

    // Once the log is quiet, a rebuild keeps the late member's document.
    let report = rebuild_all(&store, &engine).await.unwrap();
    assert_eq!(report.streams, 1);
    assert_eq!(
        store.inner.load::<Member>(store.late).await.unwrap(),
        Some(member)
    );
}
