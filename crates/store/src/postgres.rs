use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::change_set::check_expected_log;
use crate::{
    ChangeSet, CommitReceipt, DocumentMutation, EventEnvelope, EventId, Result, StoreError,
    StoredDocument, StreamId, Version,
    store::{
        AppendOptions, CommitStore, DocumentStore, EventStore, EventStream,
        validate_events_for_append,
    },
};

const UNIQUE_STREAM_VERSION: &str = "unique_stream_version";

/// PostgreSQL-backed event and document store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            stream_id: StreamId::from_uuid(row.try_get::<Uuid, _>("stream_id")?),
            version: Version::new(row.try_get("version")?),
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }

    fn row_to_document(row: PgRow) -> Result<StoredDocument> {
        Ok(StoredDocument {
            document_type: row.try_get("document_type")?,
            id: StreamId::from_uuid(row.try_get::<Uuid, _>("id")?),
            data: row.try_get("data")?,
            version: Version::new(row.try_get("version")?),
            last_modified: row.try_get("last_modified")?,
        })
    }

    /// Blocks appends by other transactions until this one ends, then reads
    /// every stream's current version.
    async fn lock_log_in_tx(
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<HashMap<StreamId, Version>> {
        sqlx::query("LOCK TABLE events IN SHARE MODE")
            .execute(&mut **tx)
            .await?;

        let rows = sqlx::query(
            "SELECT stream_id, MAX(version) AS version FROM events GROUP BY stream_id",
        )
        .fetch_all(&mut **tx)
        .await?;

        rows.into_iter()
            .map(|row| {
                let stream_id = StreamId::from_uuid(row.try_get::<Uuid, _>("stream_id")?);
                Ok::<_, StoreError>((stream_id, Version::new(row.try_get("version")?)))
            })
            .collect()
    }

    /// Appends inside an open transaction, checking the expected version.
    async fn append_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        stream_id: StreamId,
        events: &[EventEnvelope],
        options: AppendOptions,
    ) -> Result<Version> {
        validate_events_for_append(stream_id, events)?;

        // Serialize writers of the same stream for the rest of the transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(stream_id.to_string())
            .execute(&mut **tx)
            .await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = $1")
                .bind(stream_id.as_uuid())
                .fetch_one(&mut **tx)
                .await?;
        let current = Version::new(current.unwrap_or(0));

        if let Some(expected) = options.expected_version
            && current != expected
        {
            return Err(StoreError::ConcurrencyConflict {
                stream_id,
                expected,
                actual: current,
            });
        }
        let first_new_version = events[0].version;
        if first_new_version <= current {
            return Err(StoreError::ConcurrencyConflict {
                stream_id,
                expected: options.expected_version.unwrap_or(current),
                actual: current,
            });
        }
        if first_new_version != current.next() {
            return Err(StoreError::InvalidAppend(format!(
                "Stream {stream_id} is at version {current}, cannot append at {first_new_version}"
            )));
        }

        let mut last_version = current;
        for event in events {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO events (id, event_type, stream_id, version, timestamp, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(event.stream_id.as_uuid())
            .bind(event.version.as_i64())
            .bind(event.timestamp)
            .bind(&event.payload)
            .bind(metadata_json)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some(UNIQUE_STREAM_VERSION)
                {
                    return StoreError::ConcurrencyConflict {
                        stream_id,
                        expected: options.expected_version.unwrap_or(current),
                        actual: event.version,
                    };
                }
                StoreError::Database(e)
            })?;

            last_version = event.version;
        }

        Ok(last_version)
    }

    async fn upsert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        document: &StoredDocument,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (document_type, id, data, version, last_modified)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (document_type, id) DO UPDATE SET
                data = EXCLUDED.data,
                version = EXCLUDED.version,
                last_modified = EXCLUDED.last_modified
            "#,
        )
        .bind(&document.document_type)
        .bind(document.id.as_uuid())
        .bind(&document.data)
        .bind(document.version.as_i64())
        .bind(document.last_modified)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn delete_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        document_type: &str,
        id: StreamId,
    ) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE document_type = $1 AND id = $2")
            .bind(document_type)
            .bind(id.as_uuid())
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn append(
        &self,
        stream_id: StreamId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version> {
        let mut tx = self.pool.begin().await?;
        let version = Self::append_in_tx(&mut tx, stream_id, &events, options).await?;
        tx.commit().await.map_err(StoreError::Commit)?;

        metrics::counter!("store_events_appended").increment(events.len() as u64);
        Ok(version)
    }

    async fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, stream_id, version, timestamp, payload, metadata
            FROM events
            WHERE stream_id = $1 AND version >= $2
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id.as_uuid())
        .bind(from_version.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn stream_version(&self, stream_id: StreamId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream_id = $1")
                .bind(stream_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::StreamExt;

        let stream = sqlx::query(
            r#"
            SELECT id, event_type, stream_id, version, timestamp, payload, metadata
            FROM events
            ORDER BY global_position ASC
            "#,
        )
        .fetch(&self.pool)
        .map(|result| match result {
            Ok(row) => Self::row_to_event(row),
            Err(e) => Err(StoreError::Database(e)),
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn get(&self, document_type: &str, id: StreamId) -> Result<Option<StoredDocument>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT document_type, id, data, version, last_modified
            FROM documents
            WHERE document_type = $1 AND id = $2
            "#,
        )
        .bind(document_type)
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_document).transpose()
    }

    async fn get_all(&self, id: StreamId) -> Result<Vec<StoredDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT document_type, id, data, version, last_modified
            FROM documents
            WHERE id = $1
            ORDER BY document_type ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_document).collect()
    }

    async fn list(&self, document_type: &str) -> Result<Vec<StoredDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT document_type, id, data, version, last_modified
            FROM documents
            WHERE document_type = $1
            ORDER BY id ASC
            "#,
        )
        .bind(document_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_document).collect()
    }

    async fn upsert(&self, document: StoredDocument) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_in_tx(&mut tx, &document).await?;
        tx.commit().await.map_err(StoreError::Commit)
    }

    async fn delete(&self, document_type: &str, id: StreamId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::delete_in_tx(&mut tx, document_type, id).await?;
        tx.commit().await.map_err(StoreError::Commit)
    }
}

#[async_trait]
impl CommitStore for PostgresStore {
    #[tracing::instrument(
        skip_all,
        fields(events = changes.event_count(), documents = changes.mutations().len())
    )]
    async fn commit(&self, changes: ChangeSet) -> Result<CommitReceipt> {
        // Dropping the transaction on an early return rolls it back.
        let mut tx = self.pool.begin().await?;

        if let Some(expected) = changes.expected_log() {
            let actual = Self::lock_log_in_tx(&mut tx).await?;
            if let Err(err) = check_expected_log(expected, &actual) {
                metrics::counter!("store_concurrency_conflicts").increment(1);
                return Err(err);
            }
        }

        let (appends, mutations) = changes.into_parts();
        let mut receipt = CommitReceipt::default();

        for append in &appends {
            let version =
                match Self::append_in_tx(&mut tx, append.stream_id, &append.events, append.options)
                    .await
                {
                    Ok(version) => version,
                    Err(err) => {
                        if matches!(err, StoreError::ConcurrencyConflict { .. }) {
                            metrics::counter!("store_concurrency_conflicts").increment(1);
                        }
                        return Err(err);
                    }
                };
            receipt.stream_versions.insert(append.stream_id, version);
            receipt.events_appended += append.events.len();
        }

        for mutation in &mutations {
            match mutation {
                DocumentMutation::Upsert(document) => {
                    Self::upsert_in_tx(&mut tx, document).await?;
                    receipt.documents_upserted += 1;
                }
                DocumentMutation::Delete(key) => {
                    Self::delete_in_tx(&mut tx, &key.document_type, key.id).await?;
                    receipt.documents_deleted += 1;
                }
            }
        }

        tx.commit().await.map_err(StoreError::Commit)?;

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
