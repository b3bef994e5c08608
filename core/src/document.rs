//! Document identification, versioning, and JSON field paths.
//!
//! A document is a JSON object addressed by a [`DocumentKey`] (collection + id).
//! Every committed write bumps the document's [`Version`], which is what the
//! store uses to detect concurrent modification.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use thiserror::Error;

/// Address of a single document: the collection it lives in plus its id.
///
/// Collections are plain strings. Nested collections are expressed with
/// slashes, e.g. `tutor_profiles/tutor-7/bookings`.
///
/// # Examples
///
/// ```
/// use tutorlink_core::document::DocumentKey;
///
/// let key = DocumentKey::new("bookings", "booking_t1_2024-03-04_10_s1");
/// assert_eq!(key.collection(), "bookings");
/// assert_eq!(key.to_string(), "bookings/booking_t1_2024-03-04_10_s1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    collection: String,
    id: String,
}

impl DocumentKey {
    /// Create a key from a collection name and a document id.
    #[must_use]
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// The collection this document belongs to.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The document id within its collection.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Document version number for optimistic concurrency control.
///
/// A document's first write produces [`Version::FIRST`]; each later write
/// increments it by one.
///
/// # Examples
///
/// ```
/// use tutorlink_core::document::Version;
///
/// let v1 = Version::FIRST;
/// assert_eq!(v1.next(), Version::new(2));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Version assigned by the write that creates a document.
    pub const FIRST: Self = Self(1);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored document together with the version it was read at.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    /// Where the document lives
    pub key: DocumentKey,
    /// The document body (a JSON object)
    pub data: Value,
    /// Version of `data`
    pub version: Version,
}

/// Dotted path into a document body, e.g. `weekly_availability.Monday`.
///
/// List elements cannot be addressed; a path always names an object field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parse a dotted path. Empty segments are dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use tutorlink_core::document::FieldPath;
    ///
    /// let path = FieldPath::new("weekly_availability.Monday");
    /// assert_eq!(path.segments(), ["weekly_availability", "Monday"]);
    /// ```
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Build a path from already-split segments (segments may contain dots).
    #[must_use]
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The individual field names.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether the path names no field at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Errors raised while editing a document body through a [`FieldPath`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldPathError {
    /// The path has no segments.
    #[error("Field path is empty")]
    EmptyPath,

    /// An intermediate value on the path is not a JSON object.
    #[error("Field '{segment}' of path '{path}' is not an object")]
    NotAnObject {
        /// Full path being written
        path: String,
        /// Segment whose value is not an object
        segment: String,
    },

    /// The target of an increment is neither absent nor a number.
    #[error("Field '{0}' is not numeric")]
    NotNumeric(String),

    /// The increment produced a non-finite number.
    #[error("Field '{0}' would become non-finite")]
    NonFinite(String),
}

/// Read the value at `path`, if every segment exists.
#[must_use]
pub fn get_path<'a>(data: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(data, |current, segment| current.as_object()?.get(segment))
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// # Errors
///
/// Returns [`FieldPathError`] if the path is empty or crosses a non-object value.
pub fn set_path(data: &mut Value, path: &FieldPath, value: Value) -> Result<(), FieldPathError> {
    let Some((last, parents)) = path.segments().split_last() else {
        return Err(FieldPathError::EmptyPath);
    };

    let mut current = data;
    for segment in parents {
        let object = current
            .as_object_mut()
            .ok_or_else(|| FieldPathError::NotAnObject {
                path: path.to_string(),
                segment: segment.clone(),
            })?;
        current = object
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let object = current
        .as_object_mut()
        .ok_or_else(|| FieldPathError::NotAnObject {
            path: path.to_string(),
            segment: last.clone(),
        })?;
    object.insert(last.clone(), value);
    Ok(())
}

/// Add `by` to the number at `path`; a missing or null field counts as zero.
///
/// # Errors
///
/// Returns [`FieldPathError`] if the target is not numeric or the result is not finite.
pub fn increment_path(data: &mut Value, path: &FieldPath, by: f64) -> Result<(), FieldPathError> {
    let current = match get_path(data, path) {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(number)) => number
            .as_f64()
            .ok_or_else(|| FieldPathError::NotNumeric(path.to_string()))?,
        Some(_) => return Err(FieldPathError::NotNumeric(path.to_string())),
    };

    let number = Number::from_f64(current + by)
        .ok_or_else(|| FieldPathError::NonFinite(path.to_string()))?;
    set_path(data, path, Value::Number(number))
}
