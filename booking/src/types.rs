//! Domain types for tutor bookings.
//!
//! Value objects for identities, money and weekly availability, plus the
//! typed [`BookingRecord`]. Lifecycle flags on a booking are derived from its
//! status and review, so they cannot drift out of sync.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a `", stringify!($name), "` from any string")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty or whitespace only
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

string_id!(
    /// Opaque tutor identity supplied by the auth provider
    TutorId
);

string_id!(
    /// Opaque student identity supplied by the auth provider
    StudentId
);

string_id!(
    /// Deterministic booking identifier, see [`BookingId::derive`]
    BookingId
);

impl BookingId {
    /// Derive the id for a claim of `(tutor, date, hour, student)`.
    ///
    /// The same tuple always yields the same id, which makes a retried
    /// reservation collide with its own earlier success instead of creating a
    /// second booking. Tutor and student components have `%`, `_`, `/` and
    /// whitespace percent-escaped, so distinct tuples never share an id.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::NaiveDate;
    /// use tutorlink_booking::types::{BookingId, StudentId, TutorId};
    ///
    /// let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
    /// let id = BookingId::derive(&TutorId::new("tutor 1"), date, 10, &StudentId::new("s_1"));
    /// assert_eq!(id.as_str(), "booking_tutor%201_2024-03-04_10_s%5F1");
    /// ```
    #[must_use]
    pub fn derive(tutor: &TutorId, date: NaiveDate, hour: u8, student: &StudentId) -> Self {
        Self(format!(
            "booking_{}_{}_{hour}_{}",
            escape_component(tutor.as_str()),
            date.format("%Y-%m-%d"),
            escape_component(student.as_str()),
        ))
    }
}

fn escape_component(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '/') || ch.is_whitespace() {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                let _ = write!(escaped, "%{byte:02X}");
            }
        } else {
            escaped.push(ch);
        }
    }
    escaped
}

// ============================================================================
// Weekday
// ============================================================================

/// Day of the week, keyed in documents by its English name
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Weekday {
    /// Monday
    Monday,
    /// Tuesday
    Tuesday,
    /// Wednesday
    Wednesday,
    /// Thursday
    Thursday,
    /// Friday
    Friday,
    /// Saturday
    Saturday,
    /// Sunday
    Sunday,
}

impl Weekday {
    /// All days, Monday first
    pub const ALL: [Self; 7] = [
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
        Self::Saturday,
        Self::Sunday,
    ];

    /// Document key for this day
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "Monday",
            Self::Tuesday => "Tuesday",
            Self::Wednesday => "Wednesday",
            Self::Thursday => "Thursday",
            Self::Friday => "Friday",
            Self::Saturday => "Saturday",
            Self::Sunday => "Sunday",
        }
    }

    /// The weekday a calendar date falls on
    #[must_use]
    pub fn of(date: NaiveDate) -> Self {
        date.weekday().into()
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Self::Monday,
            chrono::Weekday::Tue => Self::Tuesday,
            chrono::Weekday::Wed => Self::Wednesday,
            chrono::Weekday::Thu => Self::Thursday,
            chrono::Weekday::Fri => Self::Friday,
            chrono::Weekday::Sat => Self::Saturday,
            chrono::Weekday::Sun => Self::Sunday,
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A day name that is not one of the seven English weekday names
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown weekday: {0}")]
pub struct UnknownWeekday(pub String);

impl FromStr for Weekday {
    type Err = UnknownWeekday;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|day| day.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownWeekday(s.to_string()))
    }
}

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Price in cents
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from a decimal amount, rounded to cents.
    ///
    /// Returns `None` for negative, non-finite or out-of-range amounts.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn from_decimal(amount: f64) -> Option<Self> {
        let cents = (amount * 100.0).round();
        if !cents.is_finite() || cents < 0.0 || cents > u64::MAX as f64 {
            return None;
        }
        Some(Self(cents as u64))
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// The amount as a decimal number, as stored in documents
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Availability
// ============================================================================

/// First hour offered by the availability editor
pub const EDITOR_FIRST_HOUR: u8 = 8;
/// Last hour offered by the availability editor (inclusive)
pub const EDITOR_LAST_HOUR: u8 = 17;
/// One-on-one price the availability editor assigns to new slots
pub const DEFAULT_ONE_ON_ONE_PRICE: Money = Money::from_cents(55_000);

/// Whether a session is one-on-one or a group session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    /// Single student
    OneOnOne,
    /// Several students share the slot
    Group,
}

impl SessionType {
    /// Label stored on booking documents
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneOnOne => "One-on-One",
            Self::Group => "Group",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One claimable hour of a tutor's week
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Hour of day the session starts (0-23)
    pub hour: u8,
    /// Whether the slot can still be booked
    pub is_available: bool,
    /// Group session slot
    pub is_group: bool,
    /// Capacity
    pub max_students: u32,
    /// Price per hour for group sessions
    pub group_price: Money,
    /// Price per hour for one-on-one sessions
    pub one_on_one_price: Money,
}

impl Slot {
    /// An available one-on-one slot
    #[must_use]
    pub const fn one_on_one(hour: u8, price: Money) -> Self {
        Self {
            hour,
            is_available: true,
            is_group: false,
            max_students: 1,
            group_price: Money::ZERO,
            one_on_one_price: price,
        }
    }

    /// An available group slot
    #[must_use]
    pub const fn group(hour: u8, max_students: u32, price: Money) -> Self {
        Self {
            hour,
            is_available: true,
            is_group: true,
            max_students,
            group_price: price,
            one_on_one_price: Money::ZERO,
        }
    }

    /// The slots the availability editor shows for a day: every hour from
    /// [`EDITOR_FIRST_HOUR`] to [`EDITOR_LAST_HOUR`], switched off.
    #[must_use]
    pub fn editor_day() -> Vec<Self> {
        (EDITOR_FIRST_HOUR..=EDITOR_LAST_HOUR)
            .map(|hour| Self {
                is_available: false,
                ..Self::one_on_one(hour, DEFAULT_ONE_ON_ONE_PRICE)
            })
            .collect()
    }

    /// Session type a booking of this slot gets
    #[must_use]
    pub const fn session_type(&self) -> SessionType {
        if self.is_group {
            SessionType::Group
        } else {
            SessionType::OneOnOne
        }
    }

    /// Price a booking of this slot gets
    #[must_use]
    pub const fn price(&self) -> Money {
        if self.is_group {
            self.group_price
        } else {
            self.one_on_one_price
        }
    }
}

/// Invalid availability submitted by the editor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityError {
    /// Two slots share the same day and hour
    #[error("Duplicate slot on {day} at {hour}:00")]
    DuplicateSlot {
        /// Day with the duplicate
        day: Weekday,
        /// Duplicated hour
        hour: u8,
    },

    /// Hour outside 0-23
    #[error("Invalid hour {hour} on {day}")]
    InvalidHour {
        /// Day with the bad slot
        day: Weekday,
        /// Offending hour
        hour: u8,
    },
}

/// A tutor's weekly slot map
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyAvailability {
    days: BTreeMap<Weekday, Vec<Slot>>,
}

impl WeeklyAvailability {
    /// Empty week
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slots of one day
    #[must_use]
    pub fn with_day(mut self, day: Weekday, slots: Vec<Slot>) -> Self {
        self.days.insert(day, slots);
        self
    }

    /// Replace the slots of one day in place
    pub fn set_day(&mut self, day: Weekday, slots: Vec<Slot>) {
        self.days.insert(day, slots);
    }

    /// Slots of a day, if the day is present
    #[must_use]
    pub fn day(&self, day: Weekday) -> Option<&[Slot]> {
        self.days.get(&day).map(Vec::as_slice)
    }

    /// The slot at `hour` on `day`
    #[must_use]
    pub fn slot(&self, day: Weekday, hour: u8) -> Option<&Slot> {
        self.day(day)?.iter().find(|slot| slot.hour == hour)
    }

    /// Every day with its slots, Monday first
    pub fn days(&self) -> impl Iterator<Item = (Weekday, &[Slot])> {
        self.days.iter().map(|(day, slots)| (*day, slots.as_slice()))
    }

    /// Check that every `(day, hour)` pair has at most one slot.
    ///
    /// # Errors
    ///
    /// Returns the first duplicate or out-of-range hour found.
    pub fn validate(&self) -> Result<(), AvailabilityError> {
        for (day, slots) in &self.days {
            let mut seen = [false; 24];
            for slot in slots {
                let Some(taken) = seen.get_mut(usize::from(slot.hour)) else {
                    return Err(AvailabilityError::InvalidHour { day: *day, hour: slot.hour });
                };
                if *taken {
                    return Err(AvailabilityError::DuplicateSlot { day: *day, hour: slot.hour });
                }
                *taken = true;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Booking
// ============================================================================

/// Lifecycle status of a booking
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Created by a reservation, awaiting the tutor
    Pending,
    /// Accepted by the tutor
    Confirmed,
    /// Cancelled by the tutor
    Cancelled,
    /// The student marked attendance
    Attended,
    /// The tutor completed the session
    Completed,
}

impl BookingStatus {
    /// Label stored on booking documents
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Confirmed => "Confirmed",
            Self::Cancelled => "Cancelled",
            Self::Attended => "Attended",
            Self::Completed => "Completed",
        }
    }

    /// Parse a stored label (case-insensitive)
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        [
            Self::Pending,
            Self::Confirmed,
            Self::Cancelled,
            Self::Attended,
            Self::Completed,
        ]
        .into_iter()
        .find(|status| status.as_str().eq_ignore_ascii_case(label.trim()))
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A student's rating of a completed session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// 1.0 to 5.0
    pub rating: f64,
    /// Free text, may be empty
    pub comment: String,
    /// When the rating was submitted
    pub rated_at: Option<DateTime<Utc>>,
}

/// A claimed slot and everything that happened to it since
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    /// Derived from tutor, date, hour and student
    pub booking_id: BookingId,
    /// Tutor who owns the slot
    pub tutor_id: TutorId,
    /// Student who claimed it
    pub student_id: StudentId,
    /// Display name of the tutor
    pub tutor_name: String,
    /// Display name of the student
    pub student_name: String,
    /// Weekday of `date`
    pub day: Weekday,
    /// Session date
    pub date: NaiveDate,
    /// Session start hour
    pub hour: u8,
    /// Display range, e.g. `"10:00 - 11:00"`
    pub time: String,
    /// One-on-one or group
    pub session_type: SessionType,
    /// Price of the claimed slot
    pub price: Money,
    /// Lifecycle status
    pub status: BookingStatus,
    /// Present once the student rated the session
    pub review: Option<Review>,
    /// When the reservation committed
    pub created_at: DateTime<Utc>,
    /// When the student marked attendance
    pub attended_at: Option<DateTime<Utc>>,
    /// When the tutor completed the session
    pub completed_at: Option<DateTime<Utc>>,
    /// Last lifecycle change
    pub updated_at: Option<DateTime<Utc>>,
}

impl BookingRecord {
    /// Display range for a session starting at `hour`
    #[must_use]
    pub fn time_label(hour: u8) -> String {
        format!("{hour:02}:00 - {:02}:00", u16::from(hour) + 1)
    }

    /// Group session
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.session_type == SessionType::Group
    }

    /// Cancelled by the tutor
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status == BookingStatus::Cancelled
    }

    /// Completed by the tutor
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == BookingStatus::Completed
    }

    /// The student marked attendance (completion implies it)
    #[must_use]
    pub fn student_attended(&self) -> bool {
        matches!(self.status, BookingStatus::Attended | BookingStatus::Completed)
    }

    /// The student rated the session
    #[must_use]
    pub const fn is_rated(&self) -> bool {
        self.review.is_some()
    }

    /// Submitted rating, if any
    #[must_use]
    pub fn rating(&self) -> Option<f64> {
        self.review.as_ref().map(|review| review.rating)
    }

    /// Submitted comment, if any
    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.review.as_ref().map(|review| review.comment.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    #[test]
    fn booking_id_matches_documented_shape() {
        let id = BookingId::derive(&TutorId::new("t1"), date(), 10, &StudentId::new("s1"));
        assert_eq!(id.as_str(), "booking_t1_2024-03-04_10_s1");
    }

    #[test]
    fn booking_id_escapes_separators() {
        // Without escaping both would be booking_a_b_2024-03-04_10_c
        let left = BookingId::derive(&TutorId::new("a_b"), date(), 10, &StudentId::new("c"));
        let right = BookingId::derive(&TutorId::new("a"), date(), 10, &StudentId::new("b_c"));
        assert_ne!(left, right);

        let spaced = BookingId::derive(&TutorId::new("a b"), date(), 10, &StudentId::new("c"));
        let percent = BookingId::derive(&TutorId::new("a%20b"), date(), 10, &StudentId::new("c"));
        assert_ne!(spaced, percent);
    }

    #[test]
    fn weekday_is_derived_from_date() {
        assert_eq!(Weekday::of(date()), Weekday::Monday);
        assert_eq!("friday".parse::<Weekday>().unwrap(), Weekday::Friday);
        assert!("Funday".parse::<Weekday>().is_err());
    }

    #[test]
    fn money_rounds_decimal_amounts() {
        assert_eq!(Money::from_decimal(550.0), Some(Money::from_cents(55_000)));
        assert_eq!(Money::from_decimal(19.99), Some(Money::from_cents(1_999)));
        assert_eq!(Money::from_decimal(-1.0), None);
        assert_eq!(Money::from_decimal(f64::NAN), None);
        assert_eq!(Money::from_cents(55_000).to_string(), "550.00");
    }

    #[test]
    fn slot_lookup_and_validation() {
        let week = WeeklyAvailability::new().with_day(
            Weekday::Monday,
            vec![
                Slot::one_on_one(10, DEFAULT_ONE_ON_ONE_PRICE),
                Slot::group(11, 4, Money::from_cents(20_000)),
            ],
        );

        assert_eq!(week.slot(Weekday::Monday, 11).unwrap().price(), Money::from_cents(20_000));
        assert_eq!(week.slot(Weekday::Monday, 11).unwrap().session_type(), SessionType::Group);
        assert!(week.slot(Weekday::Monday, 12).is_none());
        assert!(week.day(Weekday::Tuesday).is_none());
        assert_eq!(week.validate(), Ok(()));

        let duplicate = week.with_day(
            Weekday::Friday,
            vec![Slot::one_on_one(9, Money::ZERO), Slot::one_on_one(9, Money::ZERO)],
        );
        assert_eq!(
            duplicate.validate(),
            Err(AvailabilityError::DuplicateSlot { day: Weekday::Friday, hour: 9 })
        );
    }

    #[test]
    fn editor_day_covers_business_hours() {
        let day = Slot::editor_day();
        assert_eq!(day.len(), 10);
        assert_eq!(day.first().unwrap().hour, 8);
        assert_eq!(day.last().unwrap().hour, 17);
        assert!(day.iter().all(|slot| !slot.is_available && slot.price() == DEFAULT_ONE_ON_ONE_PRICE));
    }

    #[test]
    fn time_label_spans_one_hour() {
        assert_eq!(BookingRecord::time_label(9), "09:00 - 10:00");
        assert_eq!(BookingRecord::time_label(23), "23:00 - 24:00");
    }

    #[test]
    fn status_labels_parse_case_insensitively() {
        assert_eq!(BookingStatus::parse("confirmed"), Some(BookingStatus::Confirmed));
        assert_eq!(BookingStatus::parse("Done"), None);
    }
}
