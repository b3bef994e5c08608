//! Lifecycle reducer.

use super::actions::{Actor, LifecycleCommand, Transition};
use super::LifecycleError;
use crate::metrics;
use crate::profiles::TutorProfiles;
use crate::types::{BookingRecord, BookingStatus, Review, TutorId};
use std::sync::Arc;
use tutorlink_core::effect::Effect;
use tutorlink_core::environment::Clock;
use tutorlink_core::reducer::Reducer;
use tutorlink_core::{smallvec, SmallVec};

/// Lowest accepted rating
pub const MIN_RATING: f64 = 1.0;
/// Highest accepted rating
pub const MAX_RATING: f64 = 5.0;

/// State of one booking under the lifecycle reducer
#[derive(Clone, Debug, PartialEq)]
pub struct LifecycleState {
    /// The booking being transitioned
    pub booking: BookingRecord,
    /// Why the last command was rejected (cleared on success)
    pub last_error: Option<LifecycleError>,
}

impl LifecycleState {
    /// Wrap a loaded booking
    #[must_use]
    pub const fn new(booking: BookingRecord) -> Self {
        Self {
            booking,
            last_error: None,
        }
    }
}

/// Dependencies of the lifecycle reducer
#[derive(Clone)]
pub struct LifecycleEnvironment {
    /// Timestamps for status changes
    pub clock: Arc<dyn Clock>,
    /// Target of the side writes
    pub profiles: TutorProfiles,
    /// Hours logged per completed session
    pub hours_per_session: f64,
}

impl LifecycleEnvironment {
    /// Creates an environment
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, profiles: TutorProfiles, hours_per_session: f64) -> Self {
        Self {
            clock,
            profiles,
            hours_per_session,
        }
    }
}

/// Validates lifecycle commands and applies them to a booking.
///
/// A rejected command leaves the booking untouched, records the error in
/// `last_error` and produces no effects. Side writes come back as effects so
/// the caller runs them only after the new status is stored.
#[derive(Clone, Copy, Debug, Default)]
pub struct LifecycleReducer;

impl LifecycleReducer {
    /// Creates a new lifecycle reducer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Check a command against the booking without changing anything.
    ///
    /// # Errors
    ///
    /// Returns the first rule the command breaks: participant, then status,
    /// then the rating rules.
    pub fn validate(booking: &BookingRecord, command: &LifecycleCommand) -> Result<(), LifecycleError> {
        let transition = command.transition();
        Self::check_participant(booking, transition, command.actor())?;

        let status = booking.status;
        let illegal = || LifecycleError::IllegalTransition {
            from: status,
            transition,
        };

        match command {
            LifecycleCommand::Confirm { .. } => {
                if status != BookingStatus::Pending {
                    return Err(illegal());
                }
            },
            LifecycleCommand::Cancel { .. } => {
                if !matches!(status, BookingStatus::Pending | BookingStatus::Confirmed) {
                    return Err(illegal());
                }
            },
            LifecycleCommand::MarkAttendance { .. } => {
                if status != BookingStatus::Confirmed {
                    return Err(illegal());
                }
            },
            LifecycleCommand::Complete { .. } => match status {
                BookingStatus::Attended => {},
                BookingStatus::Confirmed => {
                    return Err(LifecycleError::AttendanceNotMarked(booking.booking_id.clone()));
                },
                _ => return Err(illegal()),
            },
            LifecycleCommand::SubmitRating { rating, .. } => {
                if status != BookingStatus::Completed {
                    return Err(illegal());
                }
                if booking.is_rated() {
                    return Err(LifecycleError::AlreadyRated(booking.booking_id.clone()));
                }
                if !rating.is_finite() || !(MIN_RATING..=MAX_RATING).contains(rating) {
                    return Err(LifecycleError::InvalidRating(*rating));
                }
            },
        }

        Ok(())
    }

    fn check_participant(
        booking: &BookingRecord,
        transition: Transition,
        actor: &Actor,
    ) -> Result<(), LifecycleError> {
        let allowed = match actor {
            Actor::Tutor(id) => transition.is_tutor_action() && *id == booking.tutor_id,
            Actor::Student(id) => !transition.is_tutor_action() && *id == booking.student_id,
        };

        if allowed {
            Ok(())
        } else {
            Err(LifecycleError::NotParticipant {
                booking_id: booking.booking_id.clone(),
                transition,
                actor: actor.clone(),
            })
        }
    }

    fn log_hours_effect(env: &LifecycleEnvironment, tutor: TutorId) -> Effect<LifecycleCommand> {
        let profiles = env.profiles.clone();
        let hours = env.hours_per_session;

        Effect::fire_and_forget(async move {
            if let Err(error) = profiles.log_hours(&tutor, hours).await {
                tracing::warn!(tutor_id = %tutor, %error, "Failed to log session hours");
                metrics::record_side_write_failure("log_hours");
            }
        })
    }

    fn recompute_rating_effect(env: &LifecycleEnvironment, tutor: TutorId) -> Effect<LifecycleCommand> {
        let profiles = env.profiles.clone();

        Effect::fire_and_forget(async move {
            if let Err(error) = profiles.recompute_rating(&tutor).await {
                tracing::warn!(tutor_id = %tutor, %error, "Failed to recompute tutor rating");
                metrics::record_side_write_failure("recompute_rating");
            }
        })
    }
}

impl Reducer for LifecycleReducer {
    type State = LifecycleState;
    type Action = LifecycleCommand;
    type Environment = LifecycleEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        if let Err(error) = Self::validate(&state.booking, &action) {
            tracing::debug!(
                booking_id = %state.booking.booking_id,
                %error,
                "Lifecycle command rejected"
            );
            state.last_error = Some(error);
            return SmallVec::new();
        }

        let now = env.clock.now();
        let booking = &mut state.booking;
        state.last_error = None;
        booking.updated_at = Some(now);

        match action {
            LifecycleCommand::Confirm { .. } => {
                booking.status = BookingStatus::Confirmed;
                SmallVec::new()
            },
            LifecycleCommand::Cancel { .. } => {
                booking.status = BookingStatus::Cancelled;
                SmallVec::new()
            },
            LifecycleCommand::MarkAttendance { .. } => {
                booking.status = BookingStatus::Attended;
                booking.attended_at = Some(now);
                SmallVec::new()
            },
            LifecycleCommand::Complete { .. } => {
                booking.status = BookingStatus::Completed;
                booking.completed_at = Some(now);
                smallvec![Self::log_hours_effect(env, booking.tutor_id.clone())]
            },
            LifecycleCommand::SubmitRating {
                rating, comment, ..
            } => {
                booking.review = Some(Review {
                    rating,
                    comment,
                    rated_at: Some(now),
                });
                smallvec![Self::recompute_rating_effect(env, booking.tutor_id.clone())]
            },
        }
    }
}
