//! Lifecycle controller scenarios: reserve, then drive the booking through
//! its statuses against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tutorlink_booking::documents::{booking_key, decode_booking, mirror_collection, mirror_key};
use tutorlink_booking::types::DEFAULT_ONE_ON_ONE_PRICE;
use tutorlink_booking::{
    BookingId, BookingLifecycle, BookingQueries, BookingRecord, BookingRequest, BookingStatus,
    LifecycleError, ReservationEngine, Slot, StudentId, Transition, TutorId, TutorProfiles,
    Weekday, WeeklyAvailability,
};
use tutorlink_core::document_store::DocumentStore;
use tutorlink_core::environment::Clock;
use tutorlink_runtime::RetryPolicy;
use tutorlink_testing::{init_test_tracing, test_clock, InMemoryDocumentStore};

fn tutor() -> TutorId {
    TutorId::new("tutor-1")
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

struct Harness {
    store: Arc<InMemoryDocumentStore>,
    engine: ReservationEngine,
    lifecycle: BookingLifecycle,
    profiles: TutorProfiles,
}

impl Harness {
    async fn new() -> Self {
        init_test_tracing();
        let store = Arc::new(InMemoryDocumentStore::new());
        let clock = Arc::new(test_clock());
        let profiles = TutorProfiles::new(store.clone()).with_retry_policy(fast_retry());
        let week = WeeklyAvailability::new().with_day(
            Weekday::Monday,
            (9..=12)
                .map(|hour| Slot::one_on_one(hour, DEFAULT_ONE_ON_ONE_PRICE))
                .collect(),
        );
        profiles.put_availability(&tutor(), &week).await.unwrap();

        Self {
            engine: ReservationEngine::new(store.clone(), clock.clone())
                .with_retry_policy(fast_retry()),
            lifecycle: BookingLifecycle::new(store.clone(), clock).with_retry_policy(fast_retry()),
            profiles,
            store,
        }
    }

    async fn reserve(&self, student: &str, hour: u8) -> BookingRecord {
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let request =
            BookingRequest::new(tutor(), "Ada", StudentId::new(student), "Grace", date, hour);
        self.engine.reserve(request).await.unwrap().booking
    }

    async fn stored(&self, id: &BookingId) -> BookingRecord {
        let doc = self.store.get(booking_key(id)).await.unwrap().unwrap();
        decode_booking(&doc.data).unwrap()
    }

    async fn attended(&self, student: &str, hour: u8) -> BookingRecord {
        let booking = self.reserve(student, hour).await;
        self.lifecycle.confirm(&booking.booking_id, &tutor()).await.unwrap();
        self.lifecycle
            .mark_attendance(&booking.booking_id, &booking.student_id)
            .await
            .unwrap()
    }

    async fn completed(&self, student: &str, hour: u8) -> BookingRecord {
        let booking = self.attended(student, hour).await;
        self.lifecycle.complete(&booking.booking_id, &tutor()).await.unwrap()
    }
}

#[tokio::test]
async fn completion_waits_for_attendance() {
    let h = Harness::new().await;
    let booking = h.reserve("student-a", 10).await;
    let id = &booking.booking_id;

    let confirmed = h.lifecycle.confirm(id, &tutor()).await.unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);

    let early = h.lifecycle.complete(id, &tutor()).await;
    assert_eq!(early, Err(LifecycleError::AttendanceNotMarked(id.clone())));
    assert_eq!(h.stored(id).await.status, BookingStatus::Confirmed);

    let attended = h.lifecycle.mark_attendance(id, &booking.student_id).await.unwrap();
    assert_eq!(attended.status, BookingStatus::Attended);
    assert!(attended.student_attended());
    assert!(!attended.is_completed());

    let completed = h.lifecycle.complete(id, &tutor()).await.unwrap();
    assert_eq!(completed.status, BookingStatus::Completed);
    assert!(completed.is_completed() && completed.student_attended());
    assert_eq!(completed.completed_at, Some(test_clock().now()));
    assert_eq!(h.stored(id).await, completed);

    let profile = h.profiles.get_profile(&tutor()).await.unwrap().unwrap();
    assert!((profile.total_hours_logged - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn lifecycle_changes_keep_reservation_fields() {
    let h = Harness::new().await;
    let booking = h.reserve("student-a", 10).await;

    let confirmed = h.lifecycle.confirm(&booking.booking_id, &tutor()).await.unwrap();

    assert_eq!(confirmed.price, booking.price);
    assert_eq!(confirmed.created_at, booking.created_at);
    assert_eq!(confirmed.time, booking.time);
    assert_eq!(confirmed.student_name, booking.student_name);
}

#[tokio::test]
async fn each_completion_logs_its_hours() {
    let h = Harness::new().await;

    h.completed("student-a", 9).await;
    h.completed("student-b", 10).await;
    h.completed("student-c", 11).await;

    let profile = h.profiles.get_profile(&tutor()).await.unwrap().unwrap();
    assert!((profile.total_hours_logged - 3.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn ratings_update_tutor_aggregates() {
    let h = Harness::new().await;
    let first = h.completed("student-a", 9).await;
    let second = h.completed("student-b", 10).await;

    let rated = h
        .lifecycle
        .submit_rating(&first.booking_id, &first.student_id, 5.0, "Brilliant")
        .await
        .unwrap();
    assert_eq!(rated.rating(), Some(5.0));
    assert_eq!(rated.comment(), Some("Brilliant"));
    assert_eq!(rated.status, BookingStatus::Completed);

    h.lifecycle
        .submit_rating(&second.booking_id, &second.student_id, 4.0, "")
        .await
        .unwrap();

    let profile = h.profiles.get_profile(&tutor()).await.unwrap().unwrap();
    assert_eq!(profile.rating_count, 2);
    assert!((profile.average_rating - 4.5).abs() < f64::EPSILON);
    assert_eq!(profile.reviews.len(), 2);
}

#[tokio::test]
async fn a_rating_is_never_overwritten() {
    let h = Harness::new().await;
    let booking = h.completed("student-a", 10).await;
    let id = &booking.booking_id;

    h.lifecycle
        .submit_rating(id, &booking.student_id, 2.0, "Late")
        .await
        .unwrap();
    let again = h
        .lifecycle
        .submit_rating(id, &booking.student_id, 5.0, "Actually great")
        .await;

    assert_eq!(again, Err(LifecycleError::AlreadyRated(id.clone())));
    let stored = h.stored(id).await;
    assert_eq!(stored.rating(), Some(2.0));
    assert_eq!(stored.comment(), Some("Late"));
}

#[tokio::test]
async fn out_of_range_ratings_are_rejected() {
    let h = Harness::new().await;
    let booking = h.completed("student-a", 10).await;

    for rating in [0.0, 0.5, 5.5, f64::NAN] {
        let result = h
            .lifecycle
            .submit_rating(&booking.booking_id, &booking.student_id, rating, "")
            .await;
        assert!(matches!(result, Err(LifecycleError::InvalidRating(_))));
    }
    assert!(!h.stored(&booking.booking_id).await.is_rated());
}

#[tokio::test]
async fn rating_before_completion_is_illegal() {
    let h = Harness::new().await;
    let booking = h.attended("student-a", 10).await;

    let result = h
        .lifecycle
        .submit_rating(&booking.booking_id, &booking.student_id, 5.0, "")
        .await;

    assert_eq!(
        result,
        Err(LifecycleError::IllegalTransition {
            from: BookingStatus::Attended,
            transition: Transition::SubmitRating,
        })
    );
}

#[tokio::test]
async fn cancelled_booking_is_final() {
    let h = Harness::new().await;
    let booking = h.reserve("student-a", 10).await;
    let id = &booking.booking_id;

    let cancelled = h.lifecycle.cancel(id, &tutor()).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert!(cancelled.is_cancelled());

    assert!(matches!(
        h.lifecycle.confirm(id, &tutor()).await,
        Err(LifecycleError::IllegalTransition { from: BookingStatus::Cancelled, .. })
    ));
    assert!(matches!(
        h.lifecycle.mark_attendance(id, &booking.student_id).await,
        Err(LifecycleError::IllegalTransition { .. })
    ));
    assert_eq!(h.stored(id).await, cancelled);
}

#[tokio::test]
async fn only_participants_may_act() {
    let h = Harness::new().await;
    let booking = h.reserve("student-a", 10).await;
    let id = &booking.booking_id;

    let stranger = h.lifecycle.confirm(id, &TutorId::new("tutor-2")).await;
    assert!(matches!(stranger, Err(LifecycleError::NotParticipant { .. })));

    h.lifecycle.confirm(id, &tutor()).await.unwrap();
    let other_student = h.lifecycle.mark_attendance(id, &StudentId::new("student-b")).await;
    assert!(matches!(other_student, Err(LifecycleError::NotParticipant { .. })));

    assert_eq!(h.stored(id).await.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn unknown_booking_is_not_found() {
    let h = Harness::new().await;
    let id = BookingId::new("nope");

    assert_eq!(
        h.lifecycle.confirm(&id, &tutor()).await,
        Err(LifecycleError::BookingNotFound(id.clone()))
    );
}

#[tokio::test]
async fn mirror_follows_status_changes() {
    let h = Harness::new().await;
    let booking = h.reserve("student-a", 10).await;

    let confirmed = h.lifecycle.confirm(&booking.booking_id, &tutor()).await.unwrap();

    let mirrored = h
        .store
        .get(mirror_key(&tutor(), &booking.booking_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(decode_booking(&mirrored.data).unwrap(), confirmed);
}

#[tokio::test]
async fn side_write_failures_do_not_fail_the_command() {
    let h = Harness::new().await;
    let booking = h.attended("student-a", 10).await;
    h.store.fail_writes_to("tutor_profiles").await;

    let completed = h.lifecycle.complete(&booking.booking_id, &tutor()).await.unwrap();

    assert_eq!(completed.status, BookingStatus::Completed);
    assert_eq!(h.stored(&booking.booking_id).await, completed);

    h.store.clear_failures().await;
    let profile = h.profiles.get_profile(&tutor()).await.unwrap().unwrap();
    assert!(profile.total_hours_logged.abs() < f64::EPSILON);
    let mirrored = h
        .store
        .get(mirror_key(&tutor(), &booking.booking_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        decode_booking(&mirrored.data).unwrap().status,
        BookingStatus::Attended
    );
    assert_eq!(h.store.collection_len(&mirror_collection(&tutor())).await, 1);
}

#[tokio::test]
async fn conflicting_writes_are_retried_against_fresh_state() {
    let h = Harness::new().await;
    let booking = h.reserve("student-a", 10).await;
    h.store.inject_conflicts(2);

    let confirmed = h.lifecycle.confirm(&booking.booking_id, &tutor()).await.unwrap();

    assert_eq!(confirmed.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn exhausted_retries_report_concurrent_modification() {
    let h = Harness::new().await;
    let booking = h.reserve("student-a", 10).await;
    h.store.inject_conflicts(10);

    let result = h.lifecycle.confirm(&booking.booking_id, &tutor()).await;

    assert_eq!(result, Err(LifecycleError::ConcurrentModification { attempts: 4 }));
    h.store.clear_failures().await;
    assert_eq!(h.stored(&booking.booking_id).await.status, BookingStatus::Pending);
}

#[tokio::test]
async fn queries_see_lifecycle_updates() {
    let h = Harness::new().await;
    let queries = BookingQueries::new(h.store.clone());
    let completed = h.completed("student-a", 9).await;
    let pending = h.reserve("student-a", 10).await;
    h.reserve("student-b", 11).await;

    let mine = queries.list_by_student(&StudentId::new("student-a")).await.unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.contains(&completed));
    assert!(mine.contains(&pending));

    let all = queries.list_by_tutor(&tutor()).await.unwrap();
    assert_eq!(all.len(), 3);

    let fetched = queries.get(&completed.booking_id).await.unwrap();
    assert_eq!(fetched, Some(completed));
}
