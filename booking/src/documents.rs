//! Document layout and the codec between documents and domain types.
//!
//! Documents are written by several clients over time, so decoding is
//! lenient where a sensible default exists and strict only where a record
//! would otherwise be meaningless (no booking id, no date).
//!
//! # Collections
//!
//! - `tutor_profiles/{tutor_id}`: availability and aggregates
//! - `bookings/{booking_id}`: primary booking records
//! - `tutor_profiles/{tutor_id}/bookings/{booking_id}`: per-tutor mirror

use crate::types::{
    BookingId, BookingRecord, BookingStatus, Money, Review, SessionType, Slot, StudentId, TutorId,
    Weekday, WeeklyAvailability,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tutorlink_core::document::{get_path, DocumentKey, FieldPath};

/// Tutor profile collection
pub const TUTOR_PROFILES: &str = "tutor_profiles";
/// Primary booking collection
pub const BOOKINGS: &str = "bookings";

/// Field names used in documents
pub mod fields {
    /// Profile owner
    pub const USER_ID: &str = "user_id";
    /// Day name -> slot list
    pub const WEEKLY_AVAILABILITY: &str = "weekly_availability";
    /// Cumulative completed hours
    pub const TOTAL_HOURS_LOGGED: &str = "total_hours_logged";
    /// Mean rating
    pub const AVERAGE_RATING: &str = "average_rating";
    /// Number of ratings behind the mean
    pub const RATING_COUNT: &str = "rating_count";
    /// Reviews, newest first
    pub const REVIEWS: &str = "reviews";

    /// Booking id
    pub const BOOKING_ID: &str = "booking_id";
    /// Tutor id on bookings
    pub const TUTOR_ID: &str = "tutor_id";
    /// Student id on bookings
    pub const STUDENT_ID: &str = "student_id";
    /// Lifecycle status
    pub const STATUS: &str = "status";
}

/// Key of a tutor's profile document
#[must_use]
pub fn profile_key(tutor: &TutorId) -> DocumentKey {
    DocumentKey::new(TUTOR_PROFILES, tutor.as_str())
}

/// Key of a primary booking document
#[must_use]
pub fn booking_key(booking: &BookingId) -> DocumentKey {
    DocumentKey::new(BOOKINGS, booking.as_str())
}

/// Collection holding a tutor's booking mirror
#[must_use]
pub fn mirror_collection(tutor: &TutorId) -> String {
    format!("{TUTOR_PROFILES}/{tutor}/{BOOKINGS}")
}

/// Key of a booking's mirror copy
#[must_use]
pub fn mirror_key(tutor: &TutorId, booking: &BookingId) -> DocumentKey {
    DocumentKey::new(mirror_collection(tutor), booking.as_str())
}

/// A document that cannot be turned into a domain value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The document body or a nested value has the wrong JSON type
    #[error("'{0}' is not an object")]
    NotAnObject(&'static str),

    /// A required field is absent or blank
    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    /// A field is present but unusable
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

// ============================================================================
// Availability
// ============================================================================

/// Decode one slot; slots without a numeric hour in 0-23 are skipped.
#[must_use]
pub fn decode_slot(value: &Value) -> Option<Slot> {
    let hour = value.get("hour").and_then(hour_of)?;

    Some(Slot {
        hour,
        is_available: bool_field(value, "is_available"),
        is_group: bool_field(value, "is_group"),
        max_students: value
            .get("max_students")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1),
        group_price: money_field(value, "group_price"),
        one_on_one_price: money_field(value, "one_on_one_price"),
    })
}

/// An hour of the day stored as an integer or a whole float (`10` or `10.0`)
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn hour_of(value: &Value) -> Option<u8> {
    let hour = match value.as_u64() {
        Some(hour) => hour,
        None => {
            let hour = value.as_f64()?;
            if !(0.0..=23.0).contains(&hour) || hour.fract() > 0.0 {
                return None;
            }
            hour as u64
        },
    };
    u8::try_from(hour).ok().filter(|hour| *hour <= 23)
}

/// Encode one slot
#[must_use]
pub fn encode_slot(slot: &Slot) -> Value {
    json!({
        "hour": slot.hour,
        "is_available": slot.is_available,
        "is_group": slot.is_group,
        "max_students": slot.max_students,
        "group_price": slot.group_price.to_decimal(),
        "one_on_one_price": slot.one_on_one_price.to_decimal(),
    })
}

/// Decode a profile's weekly availability.
///
/// Returns `Ok(None)` when the profile has no availability yet. Unknown day
/// names are ignored.
///
/// # Errors
///
/// Returns [`DecodeError`] if the availability map or a day's slot list has
/// the wrong shape.
pub fn decode_availability(profile: &Value) -> Result<Option<WeeklyAvailability>, DecodeError> {
    let raw = match profile.get(fields::WEEKLY_AVAILABILITY) {
        None | Some(Value::Null) => return Ok(None),
        Some(raw) => raw
            .as_object()
            .ok_or(DecodeError::NotAnObject(fields::WEEKLY_AVAILABILITY))?,
    };

    let mut week = WeeklyAvailability::new();
    for (name, slots) in raw {
        let Ok(day) = name.parse::<Weekday>() else {
            tracing::debug!(day = %name, "Ignoring unknown day in availability");
            continue;
        };
        let slots = slots.as_array().ok_or_else(|| DecodeError::InvalidField {
            field: fields::WEEKLY_AVAILABILITY,
            reason: format!("slots for {day} are not a list"),
        })?;
        week.set_day(day, slots.iter().filter_map(decode_slot).collect());
    }
    Ok(Some(week))
}

/// Encode a weekly availability map
#[must_use]
pub fn encode_availability(week: &WeeklyAvailability) -> Value {
    let days: Map<String, Value> = week
        .days()
        .map(|(day, slots)| {
            (
                day.as_str().to_string(),
                Value::Array(slots.iter().map(encode_slot).collect()),
            )
        })
        .collect();
    Value::Object(days)
}

/// Mark the slot at `hour` as taken in a raw day list.
///
/// Only that slot's `is_available` changes; every other entry, and every
/// other field of the claimed entry, is copied verbatim. Returns `None` if
/// the list holds no slot at `hour`.
#[must_use]
pub fn take_slot(day_slots: &Value, hour: u8) -> Option<Value> {
    let mut slots = day_slots.as_array()?.clone();
    let claimed = slots
        .iter_mut()
        .find(|slot| decode_slot(slot).is_some_and(|decoded| decoded.hour == hour))?;
    claimed
        .as_object_mut()?
        .insert("is_available".to_string(), Value::Bool(false));
    Some(Value::Array(slots))
}

/// The raw slot list stored for `day`, with the path it lives at.
///
/// Day names are matched the way [`decode_availability`] matches them, so
/// the list found here is the one the decoded week holds for `day`.
#[must_use]
pub fn day_slots(profile: &Value, day: Weekday) -> Option<(FieldPath, &Value)> {
    profile
        .get(fields::WEEKLY_AVAILABILITY)?
        .as_object()?
        .iter()
        .rev()
        .find(|(name, _)| name.parse::<Weekday>().is_ok_and(|parsed| parsed == day))
        .map(|(name, slots)| {
            (
                FieldPath::from_segments([fields::WEEKLY_AVAILABILITY, name.as_str()]),
                slots,
            )
        })
}

// ============================================================================
// Bookings
// ============================================================================

/// Encode a booking, writing the derived lifecycle flags next to `status`.
#[must_use]
pub fn encode_booking(booking: &BookingRecord) -> Value {
    let mut doc = json!({
        "booking_id": booking.booking_id.as_str(),
        "tutor_id": booking.tutor_id.as_str(),
        "tutor_name": booking.tutor_name,
        "student_id": booking.student_id.as_str(),
        "student_name": booking.student_name,
        "day": booking.day.as_str(),
        "date": booking.date.format("%Y-%m-%d").to_string(),
        "hour": booking.hour,
        "time": booking.time,
        "session_type": booking.session_type.as_str(),
        "is_group": booking.is_group(),
        "price": booking.price.to_decimal(),
        "created_at": booking.created_at.to_rfc3339(),
    });
    if let Value::Object(map) = &mut doc {
        map.extend(lifecycle_fields(booking).into_iter().map(|(path, value)| (path.to_string(), value)));
    }
    doc
}

/// The fields a lifecycle transition may change, with their new values.
///
/// Used for single-document updates so that fields the typed record does not
/// know about survive.
#[must_use]
pub fn lifecycle_fields(booking: &BookingRecord) -> Vec<(FieldPath, Value)> {
    let review = booking.review.as_ref();
    vec![
        (FieldPath::new(fields::STATUS), json!(booking.status.as_str())),
        (FieldPath::new("is_cancelled"), json!(booking.is_cancelled())),
        (FieldPath::new("is_completed"), json!(booking.is_completed())),
        (FieldPath::new("student_attended"), json!(booking.student_attended())),
        (FieldPath::new("is_rated"), json!(booking.is_rated())),
        (FieldPath::new("rating"), json!(review.map(|r| r.rating))),
        (FieldPath::new("comment"), json!(review.map(|r| r.comment.as_str()))),
        (FieldPath::new("rated_at"), timestamp(review.and_then(|r| r.rated_at))),
        (FieldPath::new("attended_at"), timestamp(booking.attended_at)),
        (FieldPath::new("completed_at"), timestamp(booking.completed_at)),
        (FieldPath::new("updated_at"), timestamp(booking.updated_at)),
    ]
}

/// Decode a booking document.
///
/// Missing strings read as empty, a missing or unknown status as `Pending`.
/// Flags written by older clients that disagree with `status` are folded
/// into it (a set `is_completed` means `Completed`, and so on).
///
/// # Errors
///
/// Returns [`DecodeError`] if the body is not an object, or the booking id,
/// date or hour is missing or invalid.
pub fn decode_booking(doc: &Value) -> Result<BookingRecord, DecodeError> {
    if !doc.is_object() {
        return Err(DecodeError::NotAnObject("booking"));
    }

    let booking_id = str_field(doc, fields::BOOKING_ID);
    if booking_id.trim().is_empty() {
        return Err(DecodeError::MissingField(fields::BOOKING_ID));
    }

    let raw_date = doc
        .get("date")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("date"))?;
    let date = NaiveDate::parse_from_str(raw_date.trim(), "%Y-%m-%d").map_err(|e| {
        DecodeError::InvalidField {
            field: "date",
            reason: e.to_string(),
        }
    })?;

    let hour = doc
        .get("hour")
        .and_then(hour_of)
        .ok_or_else(|| DecodeError::InvalidField {
            field: "hour",
            reason: "expected an integer from 0 to 23".to_string(),
        })?;

    let is_group = bool_field(doc, "is_group")
        || doc
            .get("session_type")
            .and_then(Value::as_str)
            .is_some_and(|label| label.eq_ignore_ascii_case(SessionType::Group.as_str()));

    let review = doc
        .get("rating")
        .and_then(Value::as_f64)
        .map(|rating| Review {
            rating,
            comment: str_field(doc, "comment"),
            rated_at: timestamp_field(doc, "rated_at"),
        });

    let time = str_field(doc, "time");

    Ok(BookingRecord {
        booking_id: BookingId::new(booking_id),
        tutor_id: TutorId::new(str_field(doc, fields::TUTOR_ID)),
        student_id: StudentId::new(str_field(doc, fields::STUDENT_ID)),
        tutor_name: str_field(doc, "tutor_name"),
        student_name: str_field(doc, "student_name"),
        day: doc
            .get("day")
            .and_then(Value::as_str)
            .and_then(|day| day.parse().ok())
            .unwrap_or_else(|| Weekday::of(date)),
        date,
        hour,
        time: if time.is_empty() { BookingRecord::time_label(hour) } else { time },
        session_type: if is_group { SessionType::Group } else { SessionType::OneOnOne },
        price: money_field(doc, "price"),
        status: reconcile_status(doc),
        review,
        created_at: timestamp_field(doc, "created_at").unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        attended_at: timestamp_field(doc, "attended_at"),
        completed_at: timestamp_field(doc, "completed_at"),
        updated_at: timestamp_field(doc, "updated_at"),
    })
}

fn reconcile_status(doc: &Value) -> BookingStatus {
    let status = doc
        .get(fields::STATUS)
        .and_then(Value::as_str)
        .and_then(BookingStatus::parse)
        .unwrap_or(BookingStatus::Pending);

    if bool_field(doc, "is_completed") {
        BookingStatus::Completed
    } else if bool_field(doc, "is_cancelled") {
        BookingStatus::Cancelled
    } else if bool_field(doc, "student_attended")
        && matches!(status, BookingStatus::Pending | BookingStatus::Confirmed)
    {
        BookingStatus::Attended
    } else {
        status
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn str_field(doc: &Value, field: &str) -> String {
    doc.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

fn bool_field(doc: &Value, field: &str) -> bool {
    doc.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn money_field(doc: &Value, field: &str) -> Money {
    doc.get(field)
        .and_then(Value::as_f64)
        .and_then(Money::from_decimal)
        .unwrap_or_default()
}

fn timestamp_field(doc: &Value, field: &str) -> Option<DateTime<Utc>> {
    let raw = doc.get(field)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .ok()
}

fn timestamp(time: Option<DateTime<Utc>>) -> Value {
    time.map_or(Value::Null, |time| Value::String(time.to_rfc3339()))
}

/// Read a number at `path`, treating anything else as zero.
pub(crate) fn number_at(doc: &Value, path: &str) -> f64 {
    get_path(doc, &FieldPath::new(path))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}
