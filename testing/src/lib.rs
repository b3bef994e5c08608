//! # Tutorlink Testing
//!
//! Testing utilities for tutorlink.
//!
//! This crate provides:
//! - [`FixedClock`] for deterministic timestamps
//! - [`InMemoryDocumentStore`], a [`DocumentStore`](tutorlink_core::document_store::DocumentStore)
//!   with the same commit semantics as the Postgres store plus fault injection
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tutorlink_testing::{test_clock, InMemoryDocumentStore};
//!
//! #[tokio::test]
//! async fn books_a_slot() {
//!     let store = Arc::new(InMemoryDocumentStore::new());
//!     let engine = ReservationEngine::new(store.clone(), Arc::new(test_clock()), policy);
//!
//!     engine.reserve(request).await.unwrap();
//!     assert_eq!(store.document_count().await, 3);
//! }
//! ```

use chrono::{DateTime, Utc};
use tutorlink_core::environment::Clock;

pub mod memory_store;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time until moved with [`advance`](Self::advance).
    /// Clones share the same instant.
    ///
    /// # Example
    ///
    /// ```
    /// use tutorlink_testing::mocks::FixedClock;
    /// use tutorlink_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward (used to give records distinct creation times)
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(1_735_689_600))
    }
}

/// Install a `tracing` subscriber for test output.
///
/// Honours `RUST_LOG` and is safe to call from every test; only the first
/// call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use memory_store::InMemoryDocumentStore;
pub use mocks::{test_clock, FixedClock};
pub use reducer_test::{assertions, ReducerTest};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn advance_is_shared_between_clones() {
        let clock = test_clock();
        let other = clock.clone();
        let before = clock.now();

        other.advance(chrono::Duration::minutes(5));

        assert_eq!(clock.now() - before, chrono::Duration::minutes(5));
    }
}
