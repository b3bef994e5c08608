//! Document store trait and the optimistic transaction built on top of it.
//!
//! The store is deliberately small. It offers exactly the three capabilities
//! the booking core needs:
//!
//! - **Atomic multi-document commits**: a [`WriteBatch`] carries
//!   preconditions (expected versions, or "must not exist") and writes; the
//!   store applies all writes or none of them.
//! - **Conditional single-document updates**: a batch with one precondition
//!   and one write.
//! - **Equality-filtered queries** over one collection.
//!
//! # Implementations
//!
//! - `PostgresDocumentStore` (in `tutorlink-postgres`): production store
//! - `InMemoryDocumentStore` (in `tutorlink-testing`): fast, deterministic tests
//!
//! # Example
//!
//! ```no_run
//! use tutorlink_core::document::{DocumentKey, FieldPath};
//! use tutorlink_core::document_store::{DocumentStore, DocumentStoreError, Transaction};
//! use serde_json::json;
//!
//! async fn claim(store: &dyn DocumentStore) -> Result<(), DocumentStoreError> {
//!     let key = DocumentKey::new("bookings", "booking-1");
//!     let mut tx = Transaction::new(store);
//!
//!     if tx.get(&key).await?.is_none() {
//!         tx.set(key, json!({"status": "Pending"}));
//!     }
//!
//!     // Fails with `Conflict` if anything read above changed meanwhile
//!     tx.commit().await
//! }
//! ```

use crate::document::{
    get_path, increment_path, set_path, Document, DocumentKey, FieldPath, Version,
};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`DocumentStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DocumentStoreError>> + Send + 'a>>;

/// Errors that can occur during document store operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentStoreError {
    /// A precondition did not hold at commit time.
    ///
    /// Another writer changed (or created) the document after it was read.
    /// This is the only transient error: the whole read-modify-write unit
    /// may be retried from the start.
    #[error("Concurrency conflict on {key}: expected {expected}, found {}", display_version(.actual))]
    Conflict {
        /// Document whose precondition failed
        key: DocumentKey,
        /// What the writer expected
        expected: Precondition,
        /// What the store actually holds (`None` = absent)
        actual: Option<Version>,
    },

    /// An update or increment targeted a document that does not exist.
    #[error("Document not found: {0}")]
    NotFound(DocumentKey),

    /// A write could not be applied to the document body.
    #[error("Invalid write to {key}: {reason}")]
    InvalidWrite {
        /// Target document
        key: DocumentKey,
        /// Why the write was rejected
        reason: String,
    },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Injected failure (test stores only).
    #[error("Injected failure: {0}")]
    Injected(String),
}

impl DocumentStoreError {
    /// Whether retrying the whole unit of work may succeed.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

fn display_version(version: &Option<Version>) -> String {
    version.map_or_else(|| "absent".to_string(), |v| format!("version {v}"))
}

/// Condition a document must satisfy for a batch to commit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// The document exists at exactly this version.
    Version(Version),
    /// The document does not exist.
    Absent,
}

impl Precondition {
    /// The precondition that pins a document to what was just read.
    #[must_use]
    pub fn observed(document: Option<&Document>) -> Self {
        document.map_or(Self::Absent, |doc| Self::Version(doc.version))
    }

    /// Check the precondition against the current version (`None` = absent).
    #[must_use]
    pub fn holds(self, current: Option<Version>) -> bool {
        match self {
            Self::Version(expected) => current == Some(expected),
            Self::Absent => current.is_none(),
        }
    }
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(version) => write!(f, "version {version}"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    /// Create the document or replace its whole body.
    Set {
        /// Target document
        key: DocumentKey,
        /// New body
        data: Value,
    },

    /// Overwrite individual fields of an existing document.
    Update {
        /// Target document
        key: DocumentKey,
        /// Field paths and their new values
        fields: Vec<(FieldPath, Value)>,
    },

    /// Add to a numeric field of an existing document (missing counts as zero).
    Increment {
        /// Target document
        key: DocumentKey,
        /// Numeric field
        field: FieldPath,
        /// Amount to add
        by: f64,
    },
}

impl Write {
    /// The document this write touches.
    #[must_use]
    pub const fn key(&self) -> &DocumentKey {
        match self {
            Self::Set { key, .. } | Self::Update { key, .. } | Self::Increment { key, .. } => key,
        }
    }

    /// Compute the new body of the target document.
    ///
    /// `current` is the body as it stands inside the batch (after earlier
    /// writes to the same key), or `None` when the document does not exist.
    /// Every store implementation applies writes through this function so
    /// that they agree on semantics.
    ///
    /// # Errors
    ///
    /// - `NotFound`: update or increment of a missing document
    /// - `InvalidWrite`: a field path cannot be applied to the body
    pub fn apply(&self, current: Option<&Value>) -> Result<Value, DocumentStoreError> {
        let invalid = |reason: String| DocumentStoreError::InvalidWrite {
            key: self.key().clone(),
            reason,
        };

        match self {
            Self::Set { data, .. } => {
                if data.is_object() {
                    Ok(data.clone())
                } else {
                    Err(invalid("document body must be an object".to_string()))
                }
            },
            Self::Update { key, fields } => {
                let mut data = current
                    .cloned()
                    .ok_or_else(|| DocumentStoreError::NotFound(key.clone()))?;
                for (path, value) in fields {
                    set_path(&mut data, path, value.clone()).map_err(|e| invalid(e.to_string()))?;
                }
                Ok(data)
            },
            Self::Increment { key, field, by } => {
                let mut data = current
                    .cloned()
                    .ok_or_else(|| DocumentStoreError::NotFound(key.clone()))?;
                increment_path(&mut data, field, *by).map_err(|e| invalid(e.to_string()))?;
                Ok(data)
            },
        }
    }
}

/// Preconditions plus writes, committed atomically.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    /// Conditions checked before anything is written
    pub preconditions: Vec<(DocumentKey, Precondition)>,
    /// Writes applied in order if every precondition holds
    pub writes: Vec<Write>,
}

impl WriteBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precondition.
    #[must_use]
    pub fn require(mut self, key: DocumentKey, precondition: Precondition) -> Self {
        self.preconditions.push((key, precondition));
        self
    }

    /// Add a write.
    #[must_use]
    pub fn write(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }

    /// Whether the batch would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Whether `key` must be absent for this batch to commit.
    ///
    /// Stores use this to turn a `Set` into a create-only insert.
    #[must_use]
    pub fn requires_absent(&self, key: &DocumentKey) -> bool {
        self.preconditions
            .iter()
            .any(|(k, p)| k == key && *p == Precondition::Absent)
    }
}

/// Document store abstraction.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to be shared across tasks.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be used as `Arc<dyn DocumentStore>`.
pub trait DocumentStore: Send + Sync {
    /// Load a document and its current version.
    ///
    /// # Errors
    ///
    /// - `Database`: connection or query failed
    /// - `Serialization`: stored body could not be decoded
    fn get(&self, key: DocumentKey) -> StoreFuture<'_, Option<Document>>;

    /// Atomically check every precondition and apply every write.
    ///
    /// Either all writes become visible together, or none do.
    ///
    /// # Errors
    ///
    /// - `Conflict`: a precondition did not hold (nothing written)
    /// - `NotFound` / `InvalidWrite`: a write could not be applied (nothing written)
    /// - `Database`: connection or query failed
    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, ()>;

    /// List every document in `collection` whose `field` equals `value`.
    ///
    /// No ordering is guaranteed.
    ///
    /// # Errors
    ///
    /// - `Database`: connection or query failed
    /// - `Serialization`: stored body could not be decoded
    fn query(&self, collection: String, field: FieldPath, value: Value) -> StoreFuture<'_, Vec<Document>>;
}

/// Check whether a document body matches an equality filter.
///
/// Shared by store implementations that filter in process.
#[must_use]
pub fn matches_filter(data: &Value, field: &FieldPath, value: &Value) -> bool {
    get_path(data, field) == Some(value)
}

/// Optimistic read-modify-write unit over a [`DocumentStore`].
///
/// Every read is recorded as a precondition pinning the version that was
/// observed (or its absence). Writes are buffered and sent as one
/// [`WriteBatch`] on [`commit`](Self::commit). If any document read in the
/// transaction changed before the commit, the store rejects the batch with
/// `Conflict` and nothing is written, so a committed transaction behaves as
/// if it ran alone at its commit point.
///
/// All reads must happen before the first write.
pub struct Transaction<'a> {
    store: &'a dyn DocumentStore,
    reads: Vec<(DocumentKey, Precondition)>,
    writes: Vec<Write>,
}

impl<'a> Transaction<'a> {
    /// Start a transaction against `store`.
    #[must_use]
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Read a document and pin its version for the commit.
    ///
    /// # Errors
    ///
    /// - `InvalidWrite`: called after a write was buffered
    /// - `Conflict`: the same document was read twice and changed in between
    /// - any error from the underlying store
    pub async fn get(&mut self, key: &DocumentKey) -> Result<Option<Document>, DocumentStoreError> {
        if !self.writes.is_empty() {
            return Err(DocumentStoreError::InvalidWrite {
                key: key.clone(),
                reason: "transaction reads must precede writes".to_string(),
            });
        }

        let document = self.store.get(key.clone()).await?;
        let observed = Precondition::observed(document.as_ref());

        match self.reads.iter().find(|(k, _)| k == key) {
            Some((_, earlier)) if *earlier != observed => {
                return Err(DocumentStoreError::Conflict {
                    key: key.clone(),
                    expected: *earlier,
                    actual: document.as_ref().map(|doc| doc.version),
                });
            },
            Some(_) => {},
            None => self.reads.push((key.clone(), observed)),
        }

        Ok(document)
    }

    /// Buffer a create-or-replace of a whole document.
    pub fn set(&mut self, key: DocumentKey, data: Value) {
        self.writes.push(Write::Set { key, data });
    }

    /// Buffer a field-level update of an existing document.
    pub fn update(&mut self, key: DocumentKey, fields: Vec<(FieldPath, Value)>) {
        self.writes.push(Write::Update { key, fields });
    }

    /// Buffer a numeric increment of an existing document's field.
    pub fn increment(&mut self, key: DocumentKey, field: FieldPath, by: f64) {
        self.writes.push(Write::Increment { key, field, by });
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// The batch this transaction would commit.
    #[must_use]
    pub fn into_batch(self) -> WriteBatch {
        WriteBatch {
            preconditions: self.reads,
            writes: self.writes,
        }
    }

    /// Commit all buffered writes, guarded by every recorded read.
    ///
    /// A transaction with no writes commits trivially.
    ///
    /// # Errors
    ///
    /// - `Conflict`: a document read by this transaction changed
    /// - any other error from [`DocumentStore::commit`]
    pub async fn commit(self) -> Result<(), DocumentStoreError> {
        let store = self.store;
        let batch = self.into_batch();
        if batch.is_empty() {
            return Ok(());
        }
        store.commit(batch).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> DocumentKey {
        DocumentKey::new("tutor_profiles", "tutor-1")
    }

    #[test]
    fn precondition_holds() {
        assert!(Precondition::Absent.holds(None));
        assert!(!Precondition::Absent.holds(Some(Version::FIRST)));
        assert!(Precondition::Version(Version::FIRST).holds(Some(Version::FIRST)));
        assert!(!Precondition::Version(Version::FIRST).holds(Some(Version::new(2))));
        assert!(!Precondition::Version(Version::FIRST).holds(None));
    }

    #[test]
    fn set_requires_object_body() {
        let write = Write::Set { key: key(), data: json!([1, 2]) };
        assert!(matches!(
            write.apply(None),
            Err(DocumentStoreError::InvalidWrite { .. })
        ));
    }

    #[test]
    fn update_of_missing_document_is_not_found() {
        let write = Write::Update {
            key: key(),
            fields: vec![(FieldPath::new("name"), json!("Ada"))],
        };
        assert_eq!(write.apply(None), Err(DocumentStoreError::NotFound(key())));
    }

    #[test]
    fn update_touches_only_named_fields() {
        let current = json!({"name": "Ada", "weekly_availability": {"Monday": [], "Friday": [1]}});
        let write = Write::Update {
            key: key(),
            fields: vec![(FieldPath::new("weekly_availability.Monday"), json!([2]))],
        };
        let updated = write.apply(Some(&current)).unwrap();
        assert_eq!(updated["name"], json!("Ada"));
        assert_eq!(updated["weekly_availability"]["Friday"], json!([1]));
        assert_eq!(updated["weekly_availability"]["Monday"], json!([2]));
    }

    #[test]
    fn increment_applies_to_existing_document() {
        let write = Write::Increment {
            key: key(),
            field: FieldPath::new("total_hours_logged"),
            by: 1.5,
        };
        let updated = write.apply(Some(&json!({"total_hours_logged": 2}))).unwrap();
        assert_eq!(updated["total_hours_logged"].as_f64(), Some(3.5));
    }

    #[test]
    fn batch_reports_create_only_keys() {
        let batch = WriteBatch::new()
            .require(key(), Precondition::Absent)
            .write(Write::Set { key: key(), data: json!({}) });
        assert!(batch.requires_absent(&key()));
        assert!(!batch.requires_absent(&DocumentKey::new("bookings", "x")));
    }

    #[test]
    fn conflict_error_display() {
        let error = DocumentStoreError::Conflict {
            key: key(),
            expected: Precondition::Version(Version::new(3)),
            actual: Some(Version::new(4)),
        };
        let display = error.to_string();
        assert!(display.contains("tutor_profiles/tutor-1"));
        assert!(display.contains("expected version 3"));
        assert!(display.contains("found version 4"));
        assert!(error.is_conflict());
    }

    #[test]
    fn matches_filter_compares_nested_fields() {
        let data = json!({"tutor_id": "t1", "meta": {"day": "Monday"}});
        assert!(matches_filter(&data, &FieldPath::new("tutor_id"), &json!("t1")));
        assert!(matches_filter(&data, &FieldPath::new("meta.day"), &json!("Monday")));
        assert!(!matches_filter(&data, &FieldPath::new("tutor_id"), &json!("t2")));
    }
}
