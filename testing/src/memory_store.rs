//! In-memory document store for tests.
//!
//! Behaves like the Postgres store: preconditions are checked and writes
//! applied under one write lock, so a batch is all-or-nothing and racing
//! commits are serialized. Faults can be injected to exercise conflict
//! retries and best-effort side writes.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tutorlink_core::document::{Document, DocumentKey, FieldPath, Version};
use tutorlink_core::document_store::{
    matches_filter, DocumentStore, DocumentStoreError, Precondition, StoreFuture, WriteBatch,
};

/// Thread-safe in-memory [`DocumentStore`].
///
/// # Example
///
/// ```
/// use tutorlink_testing::InMemoryDocumentStore;
/// use tutorlink_core::document::DocumentKey;
/// use tutorlink_core::document_store::DocumentStore;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryDocumentStore::new();
/// let key = DocumentKey::new("tutor_profiles", "t1");
/// store.seed(key.clone(), json!({"name": "Ada"})).await;
///
/// let doc = store.get(key).await.unwrap().unwrap();
/// assert_eq!(doc.data["name"], "Ada");
/// # });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<DocumentKey, (Value, Version)>>,
    pending_conflicts: AtomicUsize,
    failing_prefixes: RwLock<Vec<String>>,
    commits: AtomicUsize,
}

impl InMemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document directly, bypassing preconditions.
    ///
    /// Bumps the version like a regular write would.
    pub async fn seed(&self, key: DocumentKey, data: Value) {
        let mut documents = self.documents.write().await;
        let version = documents
            .get(&key)
            .map_or(Version::FIRST, |(_, version)| version.next());
        documents.insert(key, (data, version));
    }

    /// Make the next `count` commits fail with `Conflict` before touching anything.
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Reject every commit that writes to a collection starting with `prefix`.
    pub async fn fail_writes_to(&self, prefix: impl Into<String>) {
        self.failing_prefixes.write().await.push(prefix.into());
    }

    /// Stop rejecting writes.
    pub async fn clear_failures(&self) {
        self.failing_prefixes.write().await.clear();
        self.pending_conflicts.store(0, Ordering::SeqCst);
    }

    /// Number of stored documents across all collections.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Number of documents in one collection.
    pub async fn collection_len(&self, collection: &str) -> usize {
        self.documents
            .read()
            .await
            .keys()
            .filter(|key| key.collection() == collection)
            .count()
    }

    /// Current version of a document, if it exists.
    pub async fn version_of(&self, key: &DocumentKey) -> Option<Version> {
        self.documents.read().await.get(key).map(|(_, version)| *version)
    }

    /// Number of successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn commit_batch(&self, batch: WriteBatch) -> Result<(), DocumentStoreError> {
        {
            let prefixes = self.failing_prefixes.read().await;
            if let Some(write) = batch
                .writes
                .iter()
                .find(|w| prefixes.iter().any(|p| w.key().collection().starts_with(p.as_str())))
            {
                tracing::debug!(key = %write.key(), "Rejecting commit (injected write failure)");
                return Err(DocumentStoreError::Injected(format!(
                    "writes to {} are disabled",
                    write.key().collection()
                )));
            }
        }

        let mut documents = self.documents.write().await;

        if self.take_injected_conflict() {
            let key = batch
                .preconditions
                .first()
                .map(|(key, _)| key.clone())
                .or_else(|| batch.writes.first().map(|w| w.key().clone()))
                .unwrap_or_else(|| DocumentKey::new("", ""));
            let actual = documents.get(&key).map(|(_, version)| *version);
            tracing::debug!(%key, "Rejecting commit (injected conflict)");
            return Err(DocumentStoreError::Conflict {
                key,
                expected: actual.map_or(Precondition::Absent, Precondition::Version),
                actual,
            });
        }

        for (key, expected) in &batch.preconditions {
            let actual = documents.get(key).map(|(_, version)| *version);
            if !expected.holds(actual) {
                return Err(DocumentStoreError::Conflict {
                    key: key.clone(),
                    expected: *expected,
                    actual,
                });
            }
        }

        // Stage every write so a failing one leaves the store untouched.
        let mut staged: HashMap<DocumentKey, (Value, Version)> = HashMap::new();
        for write in &batch.writes {
            let key = write.key();
            let current = staged
                .get(key)
                .or_else(|| documents.get(key))
                .map(|(data, _)| data);
            let data = write.apply(current)?;
            let version = documents
                .get(key)
                .map_or(Version::FIRST, |(_, version)| version.next());
            staged.insert(key.clone(), (data, version));
        }

        documents.extend(staged);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn get(&self, key: DocumentKey) -> StoreFuture<'_, Option<Document>> {
        Box::pin(async move {
            let documents = self.documents.read().await;
            Ok(documents.get(&key).map(|(data, version)| Document {
                key: key.clone(),
                data: data.clone(),
                version: *version,
            }))
        })
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
        Box::pin(async move {
            let documents = self.documents.read().await;
            let mut matches: Vec<Document> = documents
                .iter()
                .filter(|(key, (data, _))| {
                    key.collection() == collection && matches_filter(data, &field, &value)
                })
                .map(|(key, (data, version))| Document {
                    key: key.clone(),
                    data: data.clone(),
                    version: *version,
                })
                .collect();
            matches.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(matches)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tutorlink_core::document_store::{Transaction, Write};

    fn profile() -> DocumentKey {
        DocumentKey::new("tutor_profiles", "t1")
    }

    fn booking(id: &str) -> DocumentKey {
        DocumentKey::new("bookings", id)
    }

    #[tokio::test]
    async fn versions_start_at_one_and_increment() {
        let store = InMemoryDocumentStore::new();
        let set = |n: i32| WriteBatch::new().write(Write::Set { key: profile(), data: json!({"n": n}) });

        store.commit(set(1)).await.unwrap();
        assert_eq!(store.version_of(&profile()).await, Some(Version::FIRST));

        store.commit(set(2)).await.unwrap();
        assert_eq!(store.version_of(&profile()).await, Some(Version::new(2)));
    }

    #[tokio::test]
    async fn failed_precondition_writes_nothing() {
        let store = InMemoryDocumentStore::new();
        store.seed(booking("b1"), json!({"status": "Pending"})).await;

        let batch = WriteBatch::new()
            .require(booking("b1"), Precondition::Absent)
            .write(Write::Set { key: booking("b1"), data: json!({"status": "Confirmed"}) })
            .write(Write::Set { key: booking("b2"), data: json!({}) });

        let err = store.commit(batch).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.document_count().await, 1);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn failing_write_rolls_back_earlier_writes() {
        let store = InMemoryDocumentStore::new();

        let batch = WriteBatch::new()
            .write(Write::Set { key: booking("b1"), data: json!({}) })
            .write(Write::Increment {
                key: profile(),
                field: FieldPath::new("total_hours_logged"),
                by: 1.0,
            });

        let err = store.commit(batch).await.unwrap_err();
        assert_eq!(err, DocumentStoreError::NotFound(profile()));
        assert_eq!(store.document_count().await, 0);
    }

    #[tokio::test]
    async fn later_writes_see_earlier_writes_in_same_batch() {
        let store = InMemoryDocumentStore::new();

        let batch = WriteBatch::new()
            .write(Write::Set { key: profile(), data: json!({"total_hours_logged": 1.0}) })
            .write(Write::Increment {
                key: profile(),
                field: FieldPath::new("total_hours_logged"),
                by: 2.0,
            });
        store.commit(batch).await.unwrap();

        let doc = store.get(profile()).await.unwrap().unwrap();
        assert_eq!(doc.data["total_hours_logged"].as_f64(), Some(3.0));
        assert_eq!(doc.version, Version::FIRST);
    }

    #[tokio::test]
    async fn query_filters_by_collection_and_field() {
        let store = InMemoryDocumentStore::new();
        store.seed(booking("b1"), json!({"student_id": "s1"})).await;
        store.seed(booking("b2"), json!({"student_id": "s2"})).await;
        store.seed(DocumentKey::new("tutor_profiles/t1/bookings", "b1"), json!({"student_id": "s1"})).await;

        let found = store
            .query("bookings".into(), FieldPath::new("student_id"), json!("s1"))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, booking("b1"));
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let store = InMemoryDocumentStore::new();
        store.inject_conflicts(2);
        let batch = || WriteBatch::new().write(Write::Set { key: profile(), data: json!({}) });

        assert!(store.commit(batch()).await.unwrap_err().is_conflict());
        assert!(store.commit(batch()).await.unwrap_err().is_conflict());
        store.commit(batch()).await.unwrap();
    }

    #[tokio::test]
    async fn fail_writes_to_matches_collection_prefix() {
        let store = InMemoryDocumentStore::new();
        store.fail_writes_to("tutor_profiles/").await;

        let mirror = DocumentKey::new("tutor_profiles/t1/bookings", "b1");
        let err = store
            .commit(WriteBatch::new().write(Write::Set { key: mirror, data: json!({}) }))
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentStoreError::Injected(_)));

        store
            .commit(WriteBatch::new().write(Write::Set { key: profile(), data: json!({}) }))
            .await
            .unwrap();

        store.clear_failures().await;
        assert_eq!(store.collection_len("tutor_profiles").await, 1);
    }

    #[tokio::test]
    async fn racing_transactions_have_one_winner() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.seed(profile(), json!({"claimed_by": null})).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut tx = Transaction::new(store.as_ref());
                let doc = tx.get(&profile()).await?;
                if doc.is_some_and(|d| d.data["claimed_by"].is_null()) {
                    tx.update(profile(), vec![(FieldPath::new("claimed_by"), json!(i))]);
                }
                tx.commit().await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }

        // Losers either conflict or see the claim and write nothing.
        let doc = store.get(profile()).await.unwrap().unwrap();
        assert!(!doc.data["claimed_by"].is_null());
        assert_eq!(doc.version, Version::new(2));
        assert!(winners >= 1);
        assert_eq!(store.commit_count(), 1);
    }
}
