//! `PostgreSQL` document store for tutorlink.
//!
//! Implements [`DocumentStore`] on a single `documents` table keyed by
//! `(collection, id)` with a JSONB body and a version counter.
//!
//! A commit runs in one database transaction:
//!
//! 1. Every touched row is locked with `SELECT ... FOR UPDATE`, in key order
//! 2. Preconditions are checked against the locked versions
//! 3. Writes are applied in Rust (the same [`Write::apply`] the in-memory store uses)
//! 4. Changed rows are written back with their version bumped; new rows are
//!    plain `INSERT`s, so two writers creating the same document race on the
//!    primary key and the loser gets `Conflict`
//!
//! # Example
//!
//! ```ignore
//! use tutorlink_postgres::PostgresDocumentStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresDocumentStore::new("postgres://localhost/tutorlink").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tutorlink_core::document::{Document, DocumentKey, FieldPath, Version};
use tutorlink_core::document_store::{
    DocumentStore, DocumentStoreError, Precondition, StoreFuture, WriteBatch,
};

/// SQLSTATE codes that mean "another transaction got there first".
const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// `PostgreSQL`-backed [`DocumentStore`].
#[derive(Clone, Debug)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Connect with default pool settings (10 connections, 30s acquire timeout).
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Database`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, DocumentStoreError> {
        Self::connect(database_url, 10, Duration::from_secs(30)).await
    }

    /// Connect with explicit pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Database`] if the connection fails.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DocumentStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| DocumentStoreError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `documents` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Database`] if migration fails.
    pub async fn migrate(&self) -> Result<(), DocumentStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DocumentStoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn get_document(&self, key: DocumentKey) -> Result<Option<Document>, DocumentStoreError> {
        let row = sqlx::query("SELECT data, version FROM documents WHERE collection = $1 AND id = $2")
            .bind(key.collection())
            .bind(key.id())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DocumentStoreError::Database(format!("Failed to load {key}: {e}")))?;

        row.map(|row| {
            let (data, version) = decode_row(&row)?;
            Ok(Document { key, data, version })
        })
        .transpose()
    }

    async fn commit_batch(&self, batch: WriteBatch) -> Result<(), DocumentStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DocumentStoreError::Database(format!("Failed to start transaction: {e}")))?;

        // Lock in a total order so concurrent batches cannot deadlock each other.
        let touched: BTreeSet<&DocumentKey> = batch
            .preconditions
            .iter()
            .map(|(key, _)| key)
            .chain(batch.writes.iter().map(|write| write.key()))
            .collect();

        let mut current: HashMap<DocumentKey, (Value, Version)> = HashMap::new();
        for key in touched {
            let row = sqlx::query(
                "SELECT data, version FROM documents WHERE collection = $1 AND id = $2 FOR UPDATE",
            )
            .bind(key.collection())
            .bind(key.id())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(&e, key))?;

            if let Some(row) = row {
                current.insert(key.clone(), decode_row(&row)?);
            }
        }

        for (key, expected) in &batch.preconditions {
            let actual = current.get(key).map(|(_, version)| *version);
            if !expected.holds(actual) {
                let _ = tx.rollback().await;
                metrics::counter!("tutorlink_store_commits_total", "outcome" => "conflict").increment(1);
                return Err(DocumentStoreError::Conflict {
                    key: key.clone(),
                    expected: *expected,
                    actual,
                });
            }
        }

        let mut staged: BTreeMap<DocumentKey, Value> = BTreeMap::new();
        for write in &batch.writes {
            let key = write.key();
            let body = staged
                .get(key)
                .or_else(|| current.get(key).map(|(data, _)| data));
            let data = write.apply(body)?;
            staged.insert(key.clone(), data);
        }

        for (key, data) in staged {
            match current.get(&key) {
                Some((_, version)) => {
                    sqlx::query(
                        "UPDATE documents SET data = $3, version = $4, updated_at = now() \
                         WHERE collection = $1 AND id = $2",
                    )
                    .bind(key.collection())
                    .bind(key.id())
                    .bind(Json(&data))
                    .bind(to_db_version(version.next())?)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error(&e, &key))?;
                },
                None => {
                    sqlx::query(
                        "INSERT INTO documents (collection, id, data, version) VALUES ($1, $2, $3, $4)",
                    )
                    .bind(key.collection())
                    .bind(key.id())
                    .bind(Json(&data))
                    .bind(to_db_version(Version::FIRST)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error(&e, &key))?;
                },
            }
        }

        let first_key = batch.writes.first().map(|write| write.key().clone());
        tx.commit().await.map_err(|e| match first_key {
            Some(ref key) => map_sqlx_error(&e, key),
            None => DocumentStoreError::Database(format!("Failed to commit transaction: {e}")),
        })?;

        metrics::counter!("tutorlink_store_commits_total", "outcome" => "committed").increment(1);
        tracing::trace!(writes = batch.writes.len(), "Committed document batch");
        Ok(())
    }

    async fn query_documents(
        &self,
        collection: String,
        field: FieldPath,
        value: Value,
    ) -> Result<Vec<Document>, DocumentStoreError> {
        let rows = sqlx::query(
            "SELECT id, data, version FROM documents \
             WHERE collection = $1 AND data #> $2 = $3 \
             ORDER BY id",
        )
        .bind(&collection)
        .bind(field.segments().to_vec())
        .bind(Json(&value))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DocumentStoreError::Database(format!("Failed to query {collection}: {e}")))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| DocumentStoreError::Serialization(e.to_string()))?;
                let (data, version) = decode_row(row)?;
                Ok(Document {
                    key: DocumentKey::new(collection.clone(), id),
                    data,
                    version,
                })
            })
            .collect()
    }
}

impl DocumentStore for PostgresDocumentStore {
    fn get(&self, key: DocumentKey) -> StoreFuture<'_, Option<Document>> {
        Box::pin(self.get_document(key))
    }

    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, ()> {
        Box::pin(self.commit_batch(batch))
    }

    fn query(
        &self,
        collection: String,
        field: FieldPath,
        value: Value,
    ) -> StoreFuture<'_, Vec<Document>> {
        Box::pin(self.query_documents(collection, field, value))
    }
}

fn decode_row(row: &PgRow) -> Result<(Value, Version), DocumentStoreError> {
    let Json(data): Json<Value> = row
        .try_get("data")
        .map_err(|e| DocumentStoreError::Serialization(e.to_string()))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| DocumentStoreError::Serialization(e.to_string()))?;
    let version = u64::try_from(version)
        .map_err(|_| DocumentStoreError::Serialization(format!("Negative version: {version}")))?;
    Ok((data, Version::new(version)))
}

fn to_db_version(version: Version) -> Result<i64, DocumentStoreError> {
    i64::try_from(version.value())
        .map_err(|_| DocumentStoreError::Serialization(format!("Version {version} exceeds BIGINT")))
}

/// Turn lost races into `Conflict` so callers retry them.
fn map_sqlx_error(error: &sqlx::Error, key: &DocumentKey) -> DocumentStoreError {
    if let sqlx::Error::Database(db_error) = error {
        let actual = match db_error.code().as_deref() {
            // Someone else created the row after we saw it absent.
            Some(UNIQUE_VIOLATION) => Some(Version::FIRST),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => None,
            _ => return DocumentStoreError::Database(error.to_string()),
        };
        metrics::counter!("tutorlink_store_commits_total", "outcome" => "conflict").increment(1);
        return DocumentStoreError::Conflict {
            key: key.clone(),
            expected: Precondition::Absent,
            actual,
        };
    }
    DocumentStoreError::Database(error.to_string())
}
