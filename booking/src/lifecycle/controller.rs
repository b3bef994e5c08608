//! Lifecycle controller: runs the reducer against stored bookings.

use super::actions::{Actor, LifecycleCommand};
use super::reducer::{LifecycleEnvironment, LifecycleReducer, LifecycleState};
use super::LifecycleError;
use crate::documents::{booking_key, decode_booking, lifecycle_fields};
use crate::metrics;
use crate::mirror::write_mirror;
use crate::profiles::TutorProfiles;
use crate::types::{BookingId, BookingRecord, StudentId, TutorId};
use std::sync::Arc;
use tutorlink_core::document_store::{DocumentStore, Precondition, Write, WriteBatch};
use tutorlink_core::effect::Effect;
use tutorlink_core::environment::Clock;
use tutorlink_core::reducer::Reducer;
use tutorlink_core::SmallVec;
use tutorlink_runtime::{retry_with_predicate, run_effects, RetryFailure, RetryPolicy};

type Effects = SmallVec<[Effect<LifecycleCommand>; 4]>;

/// Applies lifecycle commands to stored bookings.
///
/// Each command is one conditional single-document update: the booking is
/// loaded, the reducer decides, and the changed lifecycle fields are written
/// only if the booking still has the version that was loaded. When another
/// writer got there first the whole load-decide-write cycle is repeated, so
/// the rules are always checked against the latest record.
///
/// After the update lands, the mirror copy is refreshed and the reducer's
/// side writes run. Neither can fail the command.
#[derive(Clone)]
pub struct BookingLifecycle {
    store: Arc<dyn DocumentStore>,
    reducer: LifecycleReducer,
    env: LifecycleEnvironment,
    retry: RetryPolicy,
}

impl BookingLifecycle {
    /// Creates a controller logging one hour per completed session
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        let profiles = TutorProfiles::new(Arc::clone(&store));
        Self {
            env: LifecycleEnvironment::new(clock, profiles, 1.0),
            store,
            reducer: LifecycleReducer::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the hours logged per completed session
    #[must_use]
    pub fn with_hours_per_session(mut self, hours: f64) -> Self {
        self.env.hours_per_session = hours;
        self
    }

    /// Replace the conflict retry policy (also used for the side writes)
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.env.profiles = self.env.profiles.with_retry_policy(retry.clone());
        self.retry = retry;
        self
    }

    /// Tutor accepts a pending booking.
    ///
    /// # Errors
    ///
    /// See [`apply`](Self::apply).
    pub async fn confirm(
        &self,
        booking_id: &BookingId,
        tutor: &TutorId,
    ) -> Result<BookingRecord, LifecycleError> {
        self.apply(
            booking_id,
            LifecycleCommand::Confirm {
                actor: Actor::Tutor(tutor.clone()),
            },
        )
        .await
    }

    /// Tutor cancels a pending or confirmed booking.
    ///
    /// # Errors
    ///
    /// See [`apply`](Self::apply).
    pub async fn cancel(
        &self,
        booking_id: &BookingId,
        tutor: &TutorId,
    ) -> Result<BookingRecord, LifecycleError> {
        self.apply(
            booking_id,
            LifecycleCommand::Cancel {
                actor: Actor::Tutor(tutor.clone()),
            },
        )
        .await
    }

    /// Student marks a confirmed session as attended.
    ///
    /// # Errors
    ///
    /// See [`apply`](Self::apply).
    pub async fn mark_attendance(
        &self,
        booking_id: &BookingId,
        student: &StudentId,
    ) -> Result<BookingRecord, LifecycleError> {
        self.apply(
            booking_id,
            LifecycleCommand::MarkAttendance {
                actor: Actor::Student(student.clone()),
            },
        )
        .await
    }

    /// Tutor completes an attended session and logs its hours.
    ///
    /// # Errors
    ///
    /// `AttendanceNotMarked` while the student has not marked attendance;
    /// otherwise see [`apply`](Self::apply).
    pub async fn complete(
        &self,
        booking_id: &BookingId,
        tutor: &TutorId,
    ) -> Result<BookingRecord, LifecycleError> {
        self.apply(
            booking_id,
            LifecycleCommand::Complete {
                actor: Actor::Tutor(tutor.clone()),
            },
        )
        .await
    }

    /// Student rates a completed session; the tutor's aggregates are
    /// recomputed afterwards.
    ///
    /// # Errors
    ///
    /// `AlreadyRated` or `InvalidRating`; otherwise see [`apply`](Self::apply).
    pub async fn submit_rating(
        &self,
        booking_id: &BookingId,
        student: &StudentId,
        rating: f64,
        comment: impl Into<String>,
    ) -> Result<BookingRecord, LifecycleError> {
        self.apply(
            booking_id,
            LifecycleCommand::SubmitRating {
                actor: Actor::Student(student.clone()),
                rating,
                comment: comment.into(),
            },
        )
        .await
    }

    /// Apply any lifecycle command and return the stored result.
    ///
    /// # Errors
    ///
    /// - `BookingNotFound`: no such booking
    /// - `NotParticipant`, `IllegalTransition`, `AttendanceNotMarked`,
    ///   `AlreadyRated`, `InvalidRating`: the command was rejected and the
    ///   booking is unchanged
    /// - `ConcurrentModification`: the booking kept changing between load and
    ///   write until the retry budget ran out
    /// - `MalformedDocument`, `Store`: storage problems
    #[tracing::instrument(
        skip(self, booking_id, command),
        fields(booking_id = %booking_id, transition = %command.transition())
    )]
    pub async fn apply(
        &self,
        booking_id: &BookingId,
        command: LifecycleCommand,
    ) -> Result<BookingRecord, LifecycleError> {
        let transition = command.transition();
        let command = &command;

        let result = retry_with_predicate(
            &self.retry,
            move || self.attempt(booking_id, command.clone()),
            LifecycleError::is_retryable,
        )
        .await
        .map_err(|failure| match failure {
            RetryFailure::Permanent(error) => error,
            RetryFailure::Exhausted { attempts, .. } => {
                LifecycleError::ConcurrentModification { attempts }
            },
        });

        let (booking, effects) = match result {
            Ok(applied) => applied,
            Err(error) => {
                metrics::record_transition(transition.as_str(), error.outcome());
                tracing::warn!(%error, "Lifecycle command rejected");
                return Err(error);
            },
        };

        metrics::record_transition(transition.as_str(), "applied");
        tracing::info!(status = %booking.status, "Booking updated");

        write_mirror(self.store.as_ref(), &booking).await;
        run_effects(effects).await;

        Ok(booking)
    }

    async fn attempt(
        &self,
        booking_id: &BookingId,
        command: LifecycleCommand,
    ) -> Result<(BookingRecord, Effects), LifecycleError> {
        let key = booking_key(booking_id);
        let doc = self
            .store
            .get(key.clone())
            .await?
            .ok_or_else(|| LifecycleError::BookingNotFound(booking_id.clone()))?;

        let booking = decode_booking(&doc.data).map_err(|e| LifecycleError::MalformedDocument {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let mut state = LifecycleState::new(booking);
        let effects = self.reducer.reduce(&mut state, command, &self.env);
        if let Some(error) = state.last_error {
            return Err(error);
        }

        let batch = WriteBatch::new()
            .require(key.clone(), Precondition::Version(doc.version))
            .write(Write::Update {
                key,
                fields: lifecycle_fields(&state.booking),
            });
        self.store.commit(batch).await?;

        Ok((state.booking, effects))
    }
}
