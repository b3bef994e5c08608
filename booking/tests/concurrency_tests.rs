//! Many reservations racing for the same slot on a multi-threaded runtime.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tutorlink_booking::documents::BOOKINGS;
use tutorlink_booking::types::DEFAULT_ONE_ON_ONE_PRICE;
use tutorlink_booking::{
    BookingConfirmation, BookingRequest, ReservationEngine, ReservationError, Slot, StudentId,
    TutorId, TutorProfiles, Weekday, WeeklyAvailability,
};
use tutorlink_runtime::RetryPolicy;
use tutorlink_testing::{init_test_tracing, test_clock, InMemoryDocumentStore};

const RACERS: usize = 16;

async fn setup() -> (Arc<InMemoryDocumentStore>, ReservationEngine) {
    init_test_tracing();
    let store = Arc::new(InMemoryDocumentStore::new());
    let week = WeeklyAvailability::new().with_day(
        Weekday::Monday,
        vec![Slot::one_on_one(10, DEFAULT_ONE_ON_ONE_PRICE)],
    );
    TutorProfiles::new(store.clone())
        .put_availability(&TutorId::new("tutor-1"), &week)
        .await
        .unwrap();

    let retry = RetryPolicy::builder()
        .max_retries(RACERS)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(10))
        .build();
    let engine = ReservationEngine::new(store.clone(), Arc::new(test_clock())).with_retry_policy(retry);
    (store, engine)
}

fn request(student: &str) -> BookingRequest {
    let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
    BookingRequest::new(TutorId::new("tutor-1"), "Ada", StudentId::new(student), student, date, 10)
}

async fn race(
    engine: &ReservationEngine,
    requests: Vec<BookingRequest>,
) -> Vec<Result<BookingConfirmation, ReservationError>> {
    let handles: Vec<_> = requests
        .into_iter()
        .map(|request| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.reserve(request).await })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    outcomes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_student_wins_a_contested_slot() {
    let (store, engine) = setup().await;
    let requests = (0..RACERS).map(|i| request(&format!("student-{i}"))).collect();

    let outcomes = race(&engine, requests).await;

    let winners: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for outcome in &outcomes {
        if let Err(error) = outcome {
            assert!(
                matches!(
                    error,
                    ReservationError::SlotAlreadyTaken { .. }
                        | ReservationError::TransactionConflict { .. }
                ),
                "unexpected loser outcome: {error}"
            );
        }
    }
    assert_eq!(store.collection_len(BOOKINGS).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_requests_create_one_booking() {
    let (store, engine) = setup().await;
    let requests = (0..RACERS).map(|_| request("student-a")).collect();

    let outcomes = race(&engine, requests).await;

    let winners: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let id = &winners[0].booking.booking_id;
    for outcome in &outcomes {
        if let Err(error) = outcome {
            assert!(
                matches!(
                    error,
                    ReservationError::AlreadyBooked(existing) if existing == id
                ) || matches!(error, ReservationError::TransactionConflict { .. }),
                "unexpected duplicate outcome: {error}"
            );
        }
    }
    assert_eq!(store.collection_len(BOOKINGS).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_slots_do_not_block_each_other() {
    init_test_tracing();
    let store = Arc::new(InMemoryDocumentStore::new());
    let week = WeeklyAvailability::new().with_day(
        Weekday::Monday,
        (8..16)
            .map(|hour| Slot::one_on_one(hour, DEFAULT_ONE_ON_ONE_PRICE))
            .collect(),
    );
    TutorProfiles::new(store.clone())
        .put_availability(&TutorId::new("tutor-1"), &week)
        .await
        .unwrap();
    let retry = RetryPolicy::builder()
        .max_retries(32)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(10))
        .build();
    let engine = ReservationEngine::new(store.clone(), Arc::new(test_clock())).with_retry_policy(retry);

    let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
    let requests = (8..16u8)
        .map(|hour| {
            let student = format!("student-{hour}");
            BookingRequest::new(TutorId::new("tutor-1"), "Ada", StudentId::new(&student), student, date, hour)
        })
        .collect();

    let outcomes = race(&engine, requests).await;

    assert!(outcomes.iter().all(Result::is_ok));
    assert_eq!(store.collection_len(BOOKINGS).await, 8);
}
