//! Booking lifecycle: guarded status transitions on existing bookings.
//!
//! ```text
//! Pending ──confirm──▶ Confirmed ──attendance──▶ Attended ──complete──▶ Completed ──rating──▶ (rated)
//!    │                     │
//!    └──────cancel─────────┴──▶ Cancelled
//! ```
//!
//! [`LifecycleReducer`] holds the rules and is pure apart from the clock.
//! [`BookingLifecycle`] loads a booking, runs the reducer, writes the result
//! back with a version-guarded update, and then runs the side writes the
//! reducer asked for (logged hours, rating aggregates).

mod actions;
mod controller;
mod reducer;

pub use actions::{Actor, LifecycleCommand, Transition};
pub use controller::BookingLifecycle;
pub use reducer::{LifecycleEnvironment, LifecycleReducer, LifecycleState};

use crate::types::{BookingId, BookingStatus};
use thiserror::Error;
use tutorlink_core::document::DocumentKey;
use tutorlink_core::document_store::DocumentStoreError;

/// Lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    /// No booking with that id
    #[error("Booking not found: {0}")]
    BookingNotFound(BookingId),

    /// The actor is not the participant allowed to issue this transition
    #[error("{actor} may not {transition} booking {booking_id}")]
    NotParticipant {
        /// Target booking
        booking_id: BookingId,
        /// Requested transition
        transition: Transition,
        /// Who asked
        actor: Actor,
    },

    /// The transition is not allowed from the current status
    #[error("Cannot {transition} a {from} booking")]
    IllegalTransition {
        /// Current status
        from: BookingStatus,
        /// Requested transition
        transition: Transition,
    },

    /// Completion requested before the student marked attendance
    #[error("Booking {0} cannot be completed before attendance is marked")]
    AttendanceNotMarked(BookingId),

    /// The booking already carries a rating
    #[error("Booking {0} is already rated")]
    AlreadyRated(BookingId),

    /// Rating outside 1.0 to 5.0
    #[error("Rating {0} is outside 1-5")]
    InvalidRating(f64),

    /// Concurrent writers kept winning until the retry budget ran out
    #[error("Booking kept changing underneath the transition ({attempts} attempts)")]
    ConcurrentModification {
        /// Attempts made
        attempts: usize,
    },

    /// The stored booking cannot be decoded
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

impl LifecycleError {
    /// Whether reloading the booking and trying again may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_conflict())
    }

    /// Metric label for this outcome
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::BookingNotFound(_) => "not_found",
            Self::NotParticipant { .. } => "not_participant",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::AttendanceNotMarked(_) => "attendance_not_marked",
            Self::AlreadyRated(_) => "already_rated",
            Self::InvalidRating(_) => "invalid_rating",
            Self::ConcurrentModification { .. } => "conflict",
            Self::MalformedDocument { .. } => "malformed_document",
            Self::Store(_) => "store_error",
        }
    }
}
