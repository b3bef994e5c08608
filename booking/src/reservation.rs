//! Reservation engine: turns a booking request into a claimed slot.
//!
//! A reservation is one optimistic [`Transaction`] over two documents, the
//! tutor's profile (availability) and the booking record. Both reads pin the
//! version they saw, so the commit fails with a conflict if anybody touched
//! either document in between. The engine then re-runs the whole unit under
//! the configured [`RetryPolicy`]; a retry observes the winner's write and
//! turns into `SlotAlreadyTaken` or `AlreadyBooked`.
//!
//! No write is buffered until every check has passed, so a rejected request
//! leaves the store untouched.

use crate::documents::{
    booking_key, day_slots, decode_availability, encode_booking, profile_key, take_slot,
    DecodeError,
};
use crate::metrics;
use crate::mirror::write_mirror;
use crate::types::{BookingId, BookingRecord, BookingStatus, Slot, StudentId, TutorId, Weekday};
use chrono::NaiveDate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tutorlink_core::document::DocumentKey;
use tutorlink_core::document_store::{DocumentStore, DocumentStoreError, Transaction};
use tutorlink_core::environment::Clock;
use tutorlink_runtime::{retry_with_predicate, RetryFailure, RetryPolicy};

/// A student's request for one tutor hour on a calendar date
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingRequest {
    /// Tutor who owns the slot
    pub tutor_id: TutorId,
    /// Tutor display name copied onto the booking
    pub tutor_name: String,
    /// Student making the request
    pub student_id: StudentId,
    /// Student display name copied onto the booking
    pub student_name: String,
    /// Session date
    pub date: NaiveDate,
    /// Session start hour (0-23)
    pub hour: u8,
}

impl BookingRequest {
    /// Creates a request
    #[must_use]
    pub fn new(
        tutor_id: TutorId,
        tutor_name: impl Into<String>,
        student_id: StudentId,
        student_name: impl Into<String>,
        date: NaiveDate,
        hour: u8,
    ) -> Self {
        Self {
            tutor_id,
            tutor_name: tutor_name.into(),
            student_id,
            student_name: student_name.into(),
            date,
            hour,
        }
    }

    /// Parse an ISO `YYYY-MM-DD` date as supplied by a client.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the string is blank or not a date.
    pub fn parse_date(raw: &str) -> Result<NaiveDate, ReservationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ReservationError::InvalidRequest("date is required".to_string()));
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|e| ReservationError::InvalidRequest(format!("invalid date '{raw}': {e}")))
    }

    /// The id this request's booking gets
    #[must_use]
    pub fn booking_id(&self) -> BookingId {
        BookingId::derive(&self.tutor_id, self.date, self.hour, &self.student_id)
    }

    /// The weekday the request falls on
    #[must_use]
    pub fn day(&self) -> Weekday {
        Weekday::of(self.date)
    }

    /// Check the request before touching the store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a blank identity or an hour past 23.
    pub fn validate(&self) -> Result<(), ReservationError> {
        if self.tutor_id.is_blank() {
            return Err(ReservationError::InvalidRequest("tutor id is required".to_string()));
        }
        if self.student_id.is_blank() {
            return Err(ReservationError::InvalidRequest("student id is required".to_string()));
        }
        if self.hour > 23 {
            return Err(ReservationError::InvalidRequest(format!(
                "hour {} is outside 0-23",
                self.hour
            )));
        }
        Ok(())
    }

    fn to_record(&self, booking_id: BookingId, slot: &Slot, clock: &dyn Clock) -> BookingRecord {
        BookingRecord {
            booking_id,
            tutor_id: self.tutor_id.clone(),
            student_id: self.student_id.clone(),
            tutor_name: self.tutor_name.clone(),
            student_name: self.student_name.clone(),
            day: self.day(),
            date: self.date,
            hour: self.hour,
            time: BookingRecord::time_label(self.hour),
            session_type: slot.session_type(),
            price: slot.price(),
            status: BookingStatus::Pending,
            review: None,
            created_at: clock.now(),
            attended_at: None,
            completed_at: None,
            updated_at: None,
        }
    }
}

/// A committed reservation
#[derive(Clone, Debug, PartialEq)]
pub struct BookingConfirmation {
    /// The booking as written to the primary collection
    pub booking: BookingRecord,
    /// Whether the per-tutor mirror copy was written
    pub mirrored: bool,
    /// Transaction attempts it took (1 when uncontended)
    pub attempts: usize,
}

/// Reservation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReservationError {
    /// The request itself is unusable
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// This exact request already produced a booking
    #[error("Booking already exists: {0}")]
    AlreadyBooked(BookingId),

    /// The tutor has no profile
    #[error("Tutor not found: {0}")]
    TutorNotFound(TutorId),

    /// The tutor offers nothing on that weekday
    #[error("Tutor {tutor} has no slots on {day}")]
    NoSlotsForDay {
        /// Tutor
        tutor: TutorId,
        /// Requested weekday
        day: Weekday,
    },

    /// The weekday has slots, but none at that hour
    #[error("Tutor {tutor} has no slot on {day} at {hour}:00")]
    SlotNotFound {
        /// Tutor
        tutor: TutorId,
        /// Requested weekday
        day: Weekday,
        /// Requested hour
        hour: u8,
    },

    /// The slot exists but was claimed already
    #[error("Slot {day} {hour}:00 of tutor {tutor} is already taken")]
    SlotAlreadyTaken {
        /// Tutor
        tutor: TutorId,
        /// Requested weekday
        day: Weekday,
        /// Requested hour
        hour: u8,
    },

    /// Concurrent writers kept winning until the retry budget ran out
    #[error("Reservation kept conflicting with concurrent writes ({attempts} attempts)")]
    TransactionConflict {
        /// Attempts made
        attempts: usize,
    },

    /// A stored document could not be decoded
    #[error("Malformed document {key}: {reason}")]
    MalformedDocument {
        /// Offending document
        key: DocumentKey,
        /// Decoder message
        reason: String,
    },

    /// Store failure other than a conflict
    #[error(transparent)]
    Store(#[from] DocumentStoreError),
}

impl ReservationError {
    /// Whether re-running the transaction may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_conflict())
    }

    /// Metric label for this outcome
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::AlreadyBooked(_) => "already_booked",
            Self::TutorNotFound(_) => "tutor_not_found",
            Self::NoSlotsForDay { .. } => "no_slots_for_day",
            Self::SlotNotFound { .. } => "slot_not_found",
            Self::SlotAlreadyTaken { .. } => "slot_taken",
            Self::TransactionConflict { .. } => "conflict",
            Self::MalformedDocument { .. } => "malformed_document",
            Self::Store(_) => "store_error",
        }
    }

    fn malformed(key: &DocumentKey, error: &DecodeError) -> Self {
        Self::MalformedDocument {
            key: key.clone(),
            reason: error.to_string(),
        }
    }
}

/// Claims tutor slots atomically.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tutorlink_booking::reservation::{BookingRequest, ReservationEngine};
/// use tutorlink_booking::types::{StudentId, TutorId};
/// use tutorlink_core::environment::SystemClock;
/// use tutorlink_testing::InMemoryDocumentStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = ReservationEngine::new(Arc::new(InMemoryDocumentStore::new()), Arc::new(SystemClock));
/// let request = BookingRequest::new(
///     TutorId::new("tutor-1"),
///     "Ada",
///     StudentId::new("student-1"),
///     "Grace",
///     BookingRequest::parse_date("2024-03-04")?,
///     10,
/// );
/// let confirmation = engine.reserve(request).await?;
/// println!("booked {}", confirmation.booking.booking_id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ReservationEngine {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl ReservationEngine {
    /// Creates an engine with the default retry policy
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the conflict retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reserve the requested slot.
    ///
    /// On success the slot is marked taken and a `Pending` booking exists,
    /// both committed together. The mirror copy is written afterwards and may
    /// be missing (see [`BookingConfirmation::mirrored`]).
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: blank identity or bad hour (store not touched)
    /// - `AlreadyBooked`: the same request succeeded before
    /// - `TutorNotFound`, `NoSlotsForDay`, `SlotNotFound`, `SlotAlreadyTaken`:
    ///   business rejections
    /// - `TransactionConflict`: still conflicting after every retry
    /// - `MalformedDocument`, `Store`: storage problems
    #[tracing::instrument(
        skip(self, request),
        fields(
            tutor_id = %request.tutor_id,
            student_id = %request.student_id,
            date = %request.date,
            hour = request.hour,
        )
    )]
    pub async fn reserve(
        &self,
        request: BookingRequest,
    ) -> Result<BookingConfirmation, ReservationError> {
        let outcome = self.claim(request).await;

        match &outcome {
            Ok(confirmation) => {
                metrics::record_reservation("booked");
                tracing::info!(
                    booking_id = %confirmation.booking.booking_id,
                    attempts = confirmation.attempts,
                    mirrored = confirmation.mirrored,
                    "Slot reserved"
                );
            },
            Err(error) => {
                metrics::record_reservation(error.outcome());
                tracing::warn!(%error, "Reservation rejected");
            },
        }

        outcome
    }

    async fn claim(&self, request: BookingRequest) -> Result<BookingConfirmation, ReservationError> {
        request.validate()?;

        let booking_id = request.booking_id();
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let request = &request;
        let booking_id = &booking_id;

        let result = retry_with_predicate(
            &self.retry,
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
                self.attempt(request, booking_id)
            },
            |error: &ReservationError| {
                let retryable = error.is_retryable();
                if retryable {
                    metrics::record_reservation_conflict();
                }
                retryable
            },
        )
        .await;

        let booking = match result {
            Ok(booking) => booking,
            Err(RetryFailure::Permanent(error)) => return Err(error),
            Err(RetryFailure::Exhausted { attempts, .. }) => {
                return Err(ReservationError::TransactionConflict { attempts });
            },
        };

        let mirrored = write_mirror(self.store.as_ref(), &booking).await;

        Ok(BookingConfirmation {
            booking,
            mirrored,
            attempts: attempts.load(Ordering::Relaxed),
        })
    }

    /// One read-check-write pass. Returns the committed booking.
    async fn attempt(
        &self,
        request: &BookingRequest,
        booking_id: &BookingId,
    ) -> Result<BookingRecord, ReservationError> {
        let mut tx = Transaction::new(self.store.as_ref());
        let booking_key = booking_key(booking_id);
        let profile_key = profile_key(&request.tutor_id);
        let day = request.day();

        if tx.get(&booking_key).await?.is_some() {
            return Err(ReservationError::AlreadyBooked(booking_id.clone()));
        }

        let profile = tx
            .get(&profile_key)
            .await?
            .ok_or_else(|| ReservationError::TutorNotFound(request.tutor_id.clone()))?;

        let week = decode_availability(&profile.data)
            .map_err(|e| ReservationError::malformed(&profile_key, &e))?;
        let slots = match week.as_ref().and_then(|week| week.day(day)) {
            Some(slots) if !slots.is_empty() => slots,
            _ => {
                return Err(ReservationError::NoSlotsForDay {
                    tutor: request.tutor_id.clone(),
                    day,
                });
            },
        };

        let slot = slots
            .iter()
            .find(|slot| slot.hour == request.hour)
            .cloned()
            .ok_or_else(|| ReservationError::SlotNotFound {
                tutor: request.tutor_id.clone(),
                day,
                hour: request.hour,
            })?;

        if !slot.is_available {
            return Err(ReservationError::SlotAlreadyTaken {
                tutor: request.tutor_id.clone(),
                day,
                hour: request.hour,
            });
        }

        let (path, claimed) = day_slots(&profile.data, day)
            .and_then(|(path, raw)| take_slot(raw, request.hour).map(|claimed| (path, claimed)))
            .ok_or_else(|| ReservationError::MalformedDocument {
                key: profile_key.clone(),
                reason: format!("slot list for {day} changed shape while decoding"),
            })?;

        let booking = request.to_record(booking_id.clone(), &slot, self.clock.as_ref());
        tx.update(profile_key, vec![(path, claimed)]);
        tx.set(booking_key, encode_booking(&booking));
        tx.commit().await?;

        Ok(booking)
    }
}
