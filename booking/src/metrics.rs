//! Business metrics for bookings.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `tutorlink_reservations_total{outcome}` - Reservation attempts by outcome
//! - `tutorlink_reservation_conflicts_total` - Store conflicts seen while reserving (each one retried)
//! - `tutorlink_lifecycle_transitions_total{transition,outcome}` - Lifecycle commands by result
//! - `tutorlink_mirror_write_failures_total` - Failed best-effort mirror writes
//! - `tutorlink_side_write_failures_total{kind}` - Failed tutor profile side writes
//! - `tutorlink_malformed_documents_total{collection}` - Documents skipped by decoding

use ::metrics::{counter, describe_counter};

/// Initialize and register all booking metric descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_booking_metrics() {
    describe_counter!(
        "tutorlink_reservations_total",
        "Total number of reservation attempts by outcome (booked, already_booked, slot_taken, ...)"
    );
    describe_counter!(
        "tutorlink_reservation_conflicts_total",
        "Concurrent-write conflicts detected while reserving a slot"
    );
    describe_counter!(
        "tutorlink_lifecycle_transitions_total",
        "Booking lifecycle commands by transition and outcome"
    );
    describe_counter!(
        "tutorlink_mirror_write_failures_total",
        "Best-effort writes to the per-tutor booking mirror that failed"
    );
    describe_counter!(
        "tutorlink_side_write_failures_total",
        "Tutor profile side writes (hours, ratings) that failed"
    );
    describe_counter!(
        "tutorlink_malformed_documents_total",
        "Documents skipped because they could not be decoded"
    );

    tracing::info!("Booking metrics registered");
}

/// Record the outcome of a reservation
pub fn record_reservation(outcome: &'static str) {
    counter!("tutorlink_reservations_total", "outcome" => outcome).increment(1);
}

/// Record a store conflict during a reservation attempt
pub fn record_reservation_conflict() {
    counter!("tutorlink_reservation_conflicts_total").increment(1);
}

/// Record the outcome of a lifecycle command
pub fn record_transition(transition: &'static str, outcome: &'static str) {
    counter!(
        "tutorlink_lifecycle_transitions_total",
        "transition" => transition,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a failed mirror write
pub fn record_mirror_failure() {
    counter!("tutorlink_mirror_write_failures_total").increment(1);
}

/// Record a failed profile side write
pub fn record_side_write_failure(kind: &'static str) {
    counter!("tutorlink_side_write_failures_total", "kind" => kind).increment(1);
}

/// Record a document that could not be decoded
pub fn record_malformed_document(collection: &str) {
    counter!("tutorlink_malformed_documents_total", "collection" => collection.to_string()).increment(1);
}
