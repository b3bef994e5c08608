//! Commands accepted by the lifecycle reducer.

use crate::types::{StudentId, TutorId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who issues a command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    /// The booking's tutor
    Tutor(TutorId),
    /// The booking's student
    Student(StudentId),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tutor(id) => write!(f, "tutor {id}"),
            Self::Student(id) => write!(f, "student {id}"),
        }
    }
}

/// Lifecycle commands
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LifecycleCommand {
    /// Tutor accepts a pending booking
    Confirm {
        /// Acting participant
        actor: Actor,
    },
    /// Tutor cancels a pending or confirmed booking
    Cancel {
        /// Acting participant
        actor: Actor,
    },
    /// Student marks that the confirmed session took place
    MarkAttendance {
        /// Acting participant
        actor: Actor,
    },
    /// Tutor completes an attended session
    Complete {
        /// Acting participant
        actor: Actor,
    },
    /// Student rates a completed session (once)
    SubmitRating {
        /// Acting participant
        actor: Actor,
        /// 1.0 to 5.0
        rating: f64,
        /// Free text, may be empty
        comment: String,
    },
}

impl LifecycleCommand {
    /// The transition this command requests
    #[must_use]
    pub const fn transition(&self) -> Transition {
        match self {
            Self::Confirm { .. } => Transition::Confirm,
            Self::Cancel { .. } => Transition::Cancel,
            Self::MarkAttendance { .. } => Transition::MarkAttendance,
            Self::Complete { .. } => Transition::Complete,
            Self::SubmitRating { .. } => Transition::SubmitRating,
        }
    }

    /// The participant issuing the command
    #[must_use]
    pub const fn actor(&self) -> &Actor {
        match self {
            Self::Confirm { actor }
            | Self::Cancel { actor }
            | Self::MarkAttendance { actor }
            | Self::Complete { actor }
            | Self::SubmitRating { actor, .. } => actor,
        }
    }
}

/// Lifecycle transitions, without their payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    /// `Pending → Confirmed`
    Confirm,
    /// `Pending | Confirmed → Cancelled`
    Cancel,
    /// `Confirmed → Attended`
    MarkAttendance,
    /// `Attended → Completed`
    Complete,
    /// Rate a `Completed` booking
    SubmitRating,
}

impl Transition {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Cancel => "cancel",
            Self::MarkAttendance => "mark_attendance",
            Self::Complete => "complete",
            Self::SubmitRating => "submit_rating",
        }
    }

    /// Whether the tutor (rather than the student) issues this transition
    #[must_use]
    pub const fn is_tutor_action(self) -> bool {
        matches!(self, Self::Confirm | Self::Cancel | Self::Complete)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
