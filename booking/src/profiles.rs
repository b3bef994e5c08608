//! Tutor profile documents: availability and aggregates.
//!
//! Aggregates (`total_hours_logged`, `average_rating`, `rating_count`,
//! `reviews`) are side writes of the booking lifecycle. They are committed
//! separately from the booking and may be re-run at any time: hours are an
//! atomic increment, and ratings are always recomputed from the bookings
//! themselves rather than adjusted in place.

use crate::documents::{
    decode_availability, encode_availability, fields, number_at, profile_key, BOOKINGS,
};
use crate::queries::decode_bookings;
use crate::types::{AvailabilityError, BookingId, StudentId, TutorId, WeeklyAvailability};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::sync::Arc;
use thiserror::Error;
use tutorlink_core::document::{DocumentKey, FieldPath};
use tutorlink_core::document_store::{DocumentStore, DocumentStoreError, Transaction, Write, WriteBatch};
use tutorlink_runtime::{retry_with_predicate, RetryFailure, RetryPolicy};

/// Profile errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProfileError {
    /// No profile document for this tutor
    #[error("Tutor not found: {0}")]
    TutorNotFound(TutorId),

    /// Availability rejected before writing
    #[error("Invalid availability: {0}")]
    InvalidAvailability(#[from] AvailabilityError),

    /// The profile exists but cannot be decoded
    #[error("Malformed document {key}: {reason}")]
    MalformedDocument {
        /// Offending document
        key: DocumentKey,
        /// Decoder message
        reason: String,
    },

    /// Concurrent writers kept winning until the retry budget ran out
    #[error("Profile kept conflicting with concurrent writes ({attempts} attempts)")]
    ConcurrentModification {
        /// Attempts made
        attempts: usize,
    },

    /// Store failure
    #[error(transparent)]
    Store(#[from] DocumentStoreError),
}

impl ProfileError {
    /// Whether re-running the write may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_conflict())
    }
}

/// One review as listed on a tutor profile
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    /// Rated booking
    pub booking_id: BookingId,
    /// Reviewer
    pub student_id: StudentId,
    /// Reviewer display name
    pub student_name: String,
    /// 1.0 to 5.0
    pub rating: f64,
    /// Free text
    pub comment: String,
    /// When it was submitted
    pub rated_at: Option<DateTime<Utc>>,
}

/// Rating aggregates derived from a tutor's bookings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RatingSummary {
    /// Arithmetic mean of every rating (0.0 without ratings)
    pub average_rating: f64,
    /// Number of ratings
    pub rating_count: usize,
    /// Reviews, newest first
    pub reviews: Vec<ReviewEntry>,
}

/// A decoded tutor profile
#[derive(Clone, Debug, PartialEq)]
pub struct TutorProfile {
    /// Owner
    pub tutor_id: TutorId,
    /// Weekly slots (absent until the tutor saves some)
    pub availability: Option<WeeklyAvailability>,
    /// Hours from completed sessions
    pub total_hours_logged: f64,
    /// Mean rating
    pub average_rating: f64,
    /// Ratings behind the mean
    pub rating_count: usize,
    /// Reviews, newest first
    pub reviews: Vec<ReviewEntry>,
}

/// Access to tutor profile documents
#[derive(Clone)]
pub struct TutorProfiles {
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
}

impl TutorProfiles {
    /// Creates the profile service with the default retry policy
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the conflict retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load and decode a profile.
    ///
    /// # Errors
    ///
    /// Returns `MalformedDocument` for an undecodable availability map,
    /// `Store` if the read fails.
    pub async fn get_profile(&self, tutor: &TutorId) -> Result<Option<TutorProfile>, ProfileError> {
        let key = profile_key(tutor);
        let Some(doc) = self.store.get(key.clone()).await? else {
            return Ok(None);
        };

        let availability = decode_availability(&doc.data).map_err(|e| ProfileError::MalformedDocument {
            key,
            reason: e.to_string(),
        })?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rating_count = number_at(&doc.data, fields::RATING_COUNT).max(0.0) as usize;

        Ok(Some(TutorProfile {
            tutor_id: tutor.clone(),
            availability,
            total_hours_logged: number_at(&doc.data, fields::TOTAL_HOURS_LOGGED),
            average_rating: number_at(&doc.data, fields::AVERAGE_RATING),
            rating_count,
            reviews: doc
                .data
                .get(fields::REVIEWS)
                .cloned()
                .and_then(|reviews| serde_json::from_value(reviews).ok())
                .unwrap_or_default(),
        }))
    }

    /// Save a tutor's weekly availability, creating the profile if needed.
    ///
    /// Replaces the whole availability map; other profile fields are kept.
    ///
    /// # Errors
    ///
    /// - `InvalidAvailability`: duplicate or out-of-range slots
    /// - `ConcurrentModification`: conflicts outlasted the retry budget
    /// - `Store`: any other store failure
    #[tracing::instrument(skip(self, tutor, week), fields(tutor_id = %tutor))]
    pub async fn put_availability(
        &self,
        tutor: &TutorId,
        week: &WeeklyAvailability,
    ) -> Result<(), ProfileError> {
        week.validate()?;
        let encoded = &encode_availability(week);
        let store = self.store.as_ref();

        self.retrying(move || async move {
            let key = profile_key(tutor);
            let mut tx = Transaction::new(store);
            if tx.get(&key).await?.is_some() {
                tx.update(
                    key,
                    vec![(FieldPath::new(fields::WEEKLY_AVAILABILITY), encoded.clone())],
                );
            } else {
                tx.set(key, new_profile(tutor, encoded.clone()));
            }
            tx.commit().await.map_err(ProfileError::from)
        })
        .await?;

        tracing::info!("Availability saved");
        Ok(())
    }

    /// Add `hours` to the tutor's logged total.
    ///
    /// # Errors
    ///
    /// - `TutorNotFound`: the tutor has no profile
    /// - `ConcurrentModification`, `Store`: the increment could not be written
    #[tracing::instrument(skip(self, tutor), fields(tutor_id = %tutor))]
    pub async fn log_hours(&self, tutor: &TutorId, hours: f64) -> Result<(), ProfileError> {
        let store = self.store.as_ref();

        self.retrying(move || async move {
            let batch = WriteBatch::new().write(Write::Increment {
                key: profile_key(tutor),
                field: FieldPath::new(fields::TOTAL_HOURS_LOGGED),
                by: hours,
            });
            store.commit(batch).await.map_err(|error| missing_profile(error, tutor))
        })
        .await?;

        tracing::debug!(hours, "Session hours logged");
        Ok(())
    }

    /// Recompute rating aggregates from the tutor's rated bookings.
    ///
    /// The average is the arithmetic mean of every rating; reviews are listed
    /// newest first. Running it twice writes the same result.
    ///
    /// The profile version is pinned before the bookings are listed, so a
    /// recompute that listed an older set of ratings than a concurrent one
    /// fails its commit and runs again instead of overwriting newer totals.
    ///
    /// # Errors
    ///
    /// - `TutorNotFound`: the tutor has no profile
    /// - `ConcurrentModification`, `Store`: the aggregates could not be written
    #[tracing::instrument(skip(self, tutor), fields(tutor_id = %tutor))]
    pub async fn recompute_rating(&self, tutor: &TutorId) -> Result<RatingSummary, ProfileError> {
        let store = self.store.as_ref();

        let summary = self
            .retrying(move || async move {
                let key = profile_key(tutor);
                let mut tx = Transaction::new(store);
                if tx.get(&key).await?.is_none() {
                    return Err(ProfileError::TutorNotFound(tutor.clone()));
                }

                let docs = store
                    .query(
                        BOOKINGS.to_string(),
                        FieldPath::new(fields::TUTOR_ID),
                        Value::String(tutor.as_str().to_string()),
                    )
                    .await?;
                let summary = summarize(decode_bookings(docs).into_iter().filter_map(|booking| {
                    let review = booking.review?;
                    Some(ReviewEntry {
                        booking_id: booking.booking_id,
                        student_id: booking.student_id,
                        student_name: booking.student_name,
                        rating: review.rating,
                        comment: review.comment,
                        rated_at: review.rated_at,
                    })
                }));

                tx.update(
                    key,
                    vec![
                        (FieldPath::new(fields::AVERAGE_RATING), json!(summary.average_rating)),
                        (FieldPath::new(fields::RATING_COUNT), json!(summary.rating_count)),
                        (FieldPath::new(fields::REVIEWS), json!(summary.reviews)),
                    ],
                );
                tx.commit().await.map_err(|error| missing_profile(error, tutor))?;
                Ok::<_, ProfileError>(summary)
            })
            .await?;

        tracing::debug!(
            average_rating = summary.average_rating,
            rating_count = summary.rating_count,
            "Rating recomputed"
        );
        Ok(summary)
    }

    async fn retrying<F, Fut, T>(&self, operation: F) -> Result<T, ProfileError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProfileError>>,
    {
        retry_with_predicate(&self.retry, operation, ProfileError::is_retryable)
            .await
            .map_err(|failure| match failure {
                RetryFailure::Permanent(error) => error,
                RetryFailure::Exhausted { attempts, .. } => {
                    ProfileError::ConcurrentModification { attempts }
                },
            })
    }
}

fn new_profile(tutor: &TutorId, availability: Value) -> Value {
    json!({
        (fields::USER_ID): tutor.as_str(),
        (fields::WEEKLY_AVAILABILITY): availability,
        (fields::TOTAL_HOURS_LOGGED): 0.0,
        (fields::AVERAGE_RATING): 0.0,
        (fields::RATING_COUNT): 0,
        (fields::REVIEWS): [],
    })
}

fn missing_profile(error: DocumentStoreError, tutor: &TutorId) -> ProfileError {
    match error {
        DocumentStoreError::NotFound(_) => ProfileError::TutorNotFound(tutor.clone()),
        other => ProfileError::Store(other),
    }
}

#[allow(clippy::cast_precision_loss)]
fn summarize(reviews: impl Iterator<Item = ReviewEntry>) -> RatingSummary {
    let mut reviews: Vec<ReviewEntry> = reviews.collect();
    reviews.sort_by(|a, b| {
        Reverse(a.rated_at)
            .cmp(&Reverse(b.rated_at))
            .then_with(|| a.booking_id.cmp(&b.booking_id))
    });

    let average_rating = if reviews.is_empty() {
        0.0
    } else {
        reviews.iter().map(|review| review.rating).sum::<f64>() / reviews.len() as f64
    };

    RatingSummary {
        average_rating,
        rating_count: reviews.len(),
        reviews,
    }
}
