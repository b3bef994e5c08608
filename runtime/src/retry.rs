//! Retry logic with exponential backoff for transient failures.
//!
//! The store reports concurrent modification as a conflict; the caller is
//! expected to re-run the whole read-modify-write unit a bounded number of
//! times. [`retry_with_predicate`] does exactly that and tells the caller
//! whether it gave up because the error was permanent or because the retry
//! budget ran out.
//!
//! # Example
//!
//! ```rust
//! use tutorlink_runtime::retry::{retry_with_predicate, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(25))
//!     .max_delay(Duration::from_millis(500))
//!     .build();
//!
//! let value = retry_with_predicate(
//!     &policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("conflict"),
//! )
//! .await
//! .map_err(|failure| failure.into_inner())?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 25ms
/// - `max_delay`: 500ms
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: true (each delay is scaled by a random factor in `[0.5, 1.0]`)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Spread retries of racing callers apart
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            jitter: None,
        }
    }

    /// A policy that tries exactly once.
    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total number of attempts this policy allows.
    #[must_use]
    pub const fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Calculate the un-jittered delay for a given retry number.
    ///
    /// Uses exponential backoff: delay = `initial_delay` * (multiplier ^ attempt),
    /// capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let delay_ms = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.min(i32::MAX as usize) as i32);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms as u64)
    }

    fn sleep_for_attempt(&self, attempt: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

/// Why [`retry_with_predicate`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailure<E> {
    /// The predicate classified the error as not retryable.
    Permanent(E),
    /// Every allowed attempt failed with a retryable error.
    Exhausted {
        /// How many times the operation ran
        attempts: usize,
        /// The error from the final attempt
        last_error: E,
    },
}

impl<E> RetryFailure<E> {
    /// The underlying error, whichever way the retry loop ended.
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(err) | Self::Exhausted { last_error: err, .. } => err,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent(err) => write!(f, "{err}"),
            Self::Exhausted { attempts, last_error } => {
                write!(f, "gave up after {attempts} attempts: {last_error}")
            },
        }
    }
}

impl<E: std::error::Error> std::error::Error for RetryFailure<E> {}

/// Retry an async operation while `is_retryable` accepts its error.
///
/// The operation is re-created on every attempt, so it must redo all of its
/// reads (a retry of a transaction starts from a fresh snapshot).
///
/// # Errors
///
/// - [`RetryFailure::Permanent`] as soon as a non-retryable error occurs
/// - [`RetryFailure::Exhausted`] once `policy.max_attempts()` attempts failed
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(RetryFailure::Permanent(err));
                }

                if attempt >= policy.max_retries {
                    tracing::warn!(
                        attempts = attempt + 1,
                        error = %err,
                        "Operation failed after max retries"
                    );
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt + 1,
                        last_error: err,
                    });
                }

                let delay = policy.sleep_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Retryable failure, backing off"
                );
                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
