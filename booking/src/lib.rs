//! Tutorlink bookings - slot reservation and session lifecycle for a tutoring marketplace
//!
//! Students book hourly slots from a tutor's weekly availability; tutors
//! confirm, students mark attendance, tutors complete, students rate. This
//! crate holds the parts of that flow with real correctness hazards:
//!
//! - **Reservation**: many students may race for one slot. A claim reads the
//!   tutor's availability and the would-be booking in one optimistic
//!   transaction and writes both or neither.
//! - **Lifecycle**: status changes follow a fixed table. Completion cannot
//!   skip attendance, and a rating is written once.
//! - **Queries**: bookings by student or tutor, read from the primary
//!   collection.
//!
//! # Architecture
//!
//! ```text
//!                     ┌────────────────────┐
//!   BookingRequest ──▶│ ReservationEngine  │── one transaction ──┐
//!                     └────────────────────┘                     │
//!                                                                ▼
//!                     ┌────────────────────┐           ┌──────────────────┐
//!   LifecycleCommand ▶│ BookingLifecycle   │──update──▶│  DocumentStore   │
//!                     │  (LifecycleReducer)│           │ tutor_profiles/  │
//!                     └────────────────────┘           │ bookings/        │
//!                              │ effects               └──────────────────┘
//!                              ▼                                 ▲
//!                     ┌────────────────────┐                     │
//!                     │   TutorProfiles    │──hours, ratings─────┤
//!                     └────────────────────┘                     │
//!                     ┌────────────────────┐                     │
//!                     │   BookingQueries   │──────reads──────────┘
//!                     └────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! For any `(tutor, date, hour)` at most one reservation observes the slot as
//! available and commits. Losers either see the slot taken on their next
//! attempt (`SlotAlreadyTaken`) or run out of retries
//! (`TransactionConflict`). There is no client-side locking; correctness
//! rests on the store rejecting stale commits.

#![forbid(unsafe_code)]

pub mod config;
pub mod documents;
pub mod lifecycle;
pub mod metrics;
pub mod mirror;
pub mod profiles;
pub mod queries;
pub mod reservation;
pub mod types;

pub use config::Config;
pub use lifecycle::{Actor, BookingLifecycle, LifecycleCommand, LifecycleError, Transition};
pub use profiles::{ProfileError, RatingSummary, ReviewEntry, TutorProfile, TutorProfiles};
pub use queries::{sort_newest_first, BookingQueries, QueryError};
pub use reservation::{BookingConfirmation, BookingRequest, ReservationEngine, ReservationError};
pub use types::{
    BookingId, BookingRecord, BookingStatus, Money, SessionType, Slot, StudentId, TutorId,
    Weekday, WeeklyAvailability,
};
