//! Read-side projections over the primary booking collection.
//!
//! The store guarantees no order, so callers sort with
//! [`sort_newest_first`] before presenting results. The per-tutor mirror is
//! never read here: it may lag the primary collection.

use crate::documents::{booking_key, decode_booking, fields, BOOKINGS};
use crate::metrics;
use crate::types::{BookingId, BookingRecord, StudentId, TutorId};
use serde_json::Value;
use std::cmp::Reverse;
use std::sync::Arc;
use thiserror::Error;
use tutorlink_core::document::{Document, DocumentKey, FieldPath};
use tutorlink_core::document_store::{DocumentStore, DocumentStoreError};

/// Query errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The requested booking exists but cannot be decoded
    #[error("Malformed document {key}: {reason}")]
    MalformedDocument {
        /// Offending document
        key: DocumentKey,
        /// Decoder message
        reason: String,
    },

    /// Store failure
    #[error(transparent)]
    Store(#[from] DocumentStoreError),
}

/// Booking lookups by participant
#[derive(Clone)]
pub struct BookingQueries {
    store: Arc<dyn DocumentStore>,
}

impl BookingQueries {
    /// Creates the query layer over `store`
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Every booking the student made, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the query fails. Undecodable records are skipped.
    pub async fn list_by_student(
        &self,
        student: &StudentId,
    ) -> Result<Vec<BookingRecord>, QueryError> {
        if student.is_blank() {
            return Ok(Vec::new());
        }
        self.list_where(fields::STUDENT_ID, student.as_str()).await
    }

    /// Every booking of the tutor, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the query fails. Undecodable records are skipped.
    pub async fn list_by_tutor(&self, tutor: &TutorId) -> Result<Vec<BookingRecord>, QueryError> {
        if tutor.is_blank() {
            return Ok(Vec::new());
        }
        self.list_where(fields::TUTOR_ID, tutor.as_str()).await
    }

    /// Load one booking.
    ///
    /// # Errors
    ///
    /// Returns `MalformedDocument` if the record exists but cannot be
    /// decoded, `Store` if the read fails.
    pub async fn get(&self, booking: &BookingId) -> Result<Option<BookingRecord>, QueryError> {
        let key = booking_key(booking);
        let Some(doc) = self.store.get(key.clone()).await? else {
            return Ok(None);
        };
        decode_booking(&doc.data)
            .map(Some)
            .map_err(|e| QueryError::MalformedDocument {
                key,
                reason: e.to_string(),
            })
    }

    async fn list_where(&self, field: &str, id: &str) -> Result<Vec<BookingRecord>, QueryError> {
        let docs = self
            .store
            .query(
                BOOKINGS.to_string(),
                FieldPath::new(field),
                Value::String(id.to_string()),
            )
            .await?;
        Ok(decode_bookings(docs))
    }
}

/// Decode query results, skipping (and counting) records that fail.
pub(crate) fn decode_bookings(docs: Vec<Document>) -> Vec<BookingRecord> {
    docs.into_iter()
        .filter_map(|doc| match decode_booking(&doc.data) {
            Ok(booking) => Some(booking),
            Err(error) => {
                tracing::warn!(key = %doc.key, %error, "Skipping malformed booking");
                metrics::record_malformed_document(doc.key.collection());
                None
            },
        })
        .collect()
}

/// Order for display: newest `created_at` first, ties by booking id.
pub fn sort_newest_first(bookings: &mut [BookingRecord]) {
    bookings.sort_by(|a, b| {
        Reverse(a.created_at)
            .cmp(&Reverse(b.created_at))
            .then_with(|| a.booking_id.cmp(&b.booking_id))
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::documents::encode_booking;
    use crate::types::{BookingStatus, Money, SessionType, Weekday};
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use serde_json::json;
    use tutorlink_testing::InMemoryDocumentStore;

    fn booking(id: &str, tutor: &str, student: &str, minute: i64) -> BookingRecord {
        BookingRecord {
            booking_id: BookingId::new(id),
            tutor_id: TutorId::new(tutor),
            student_id: StudentId::new(student),
            tutor_name: String::new(),
            student_name: String::new(),
            day: Weekday::Monday,
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            hour: 10,
            time: BookingRecord::time_label(10),
            session_type: SessionType::OneOnOne,
            price: Money::from_cents(55_000),
            status: BookingStatus::Pending,
            review: None,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute),
            attended_at: None,
            completed_at: None,
            updated_at: None,
        }
    }

    async fn seeded(bookings: &[BookingRecord]) -> Arc<InMemoryDocumentStore> {
        let store = Arc::new(InMemoryDocumentStore::new());
        for booking in bookings {
            store
                .seed(booking_key(&booking.booking_id), encode_booking(booking))
                .await;
        }
        store
    }

    #[tokio::test]
    async fn lists_only_the_requested_participant() {
        let store = seeded(&[
            booking("b1", "t1", "s1", 0),
            booking("b2", "t1", "s2", 1),
            booking("b3", "t2", "s1", 2),
        ])
        .await;
        let queries = BookingQueries::new(store);

        let mut by_student = queries.list_by_student(&StudentId::new("s1")).await.unwrap();
        sort_newest_first(&mut by_student);
        let ids: Vec<_> = by_student.iter().map(|b| b.booking_id.as_str()).collect();
        assert_eq!(ids, vec!["b3", "b1"]);

        let by_tutor = queries.list_by_tutor(&TutorId::new("t1")).await.unwrap();
        assert_eq!(by_tutor.len(), 2);
        assert!(by_tutor.iter().all(|b| b.tutor_id.as_str() == "t1"));
    }

    #[tokio::test]
    async fn blank_identity_returns_nothing() {
        let store = seeded(&[booking("b1", "t1", "s1", 0)]).await;
        let queries = BookingQueries::new(store);

        assert!(queries.list_by_student(&StudentId::new("  ")).await.unwrap().is_empty());
        assert!(queries.list_by_tutor(&TutorId::new("")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_in_lists() {
        let store = seeded(&[booking("b1", "t1", "s1", 0)]).await;
        store
            .seed(
                DocumentKey::new(BOOKINGS, "broken"),
                json!({"tutor_id": "t1", "date": "soon"}),
            )
            .await;
        let queries = BookingQueries::new(store);

        let listed = queries.list_by_tutor(&TutorId::new("t1")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(matches!(
            queries.get(&BookingId::new("broken")).await,
            Err(QueryError::MalformedDocument { .. })
        ));
    }

    #[tokio::test]
    async fn get_missing_booking_is_none() {
        let queries = BookingQueries::new(Arc::new(InMemoryDocumentStore::new()));
        assert_eq!(queries.get(&BookingId::new("nope")).await.unwrap(), None);
    }

    #[test]
    fn equal_timestamps_sort_by_id() {
        let mut bookings = vec![
            booking("b2", "t1", "s1", 5),
            booking("b1", "t1", "s1", 5),
            booking("b0", "t1", "s1", 0),
        ];
        sort_newest_first(&mut bookings);
        let ids: Vec<_> = bookings.iter().map(|b| b.booking_id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2", "b0"]);
    }
}
