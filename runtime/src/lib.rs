//! # Tutorlink Runtime
//!
//! Executes the effect descriptions returned by reducers and provides retry
//! with exponential backoff for transient store conflicts.
//!
//! Unlike a long-lived store loop, effects here are run by the caller right
//! after it has persisted the reducer's state change, so a failed commit never
//! leaks side effects.
//!
//! ## Example
//!
//! ```ignore
//! use tutorlink_runtime::run_effects;
//!
//! let effects = reducer.reduce(&mut state, action, &env);
//! persist(&state).await?;
//! let feedback = run_effects(effects).await;
//! ```

use tutorlink_core::effect::Effect;

/// Retry logic with exponential backoff
pub mod retry;

pub use retry::{retry_with_predicate, RetryFailure, RetryPolicy};

/// Execute effects and collect the actions they feed back.
///
/// Effects run one after the other in the order given, and feedback actions
/// are returned in that order.
pub async fn run_effects<A, I>(effects: I) -> Vec<A>
where
    A: Send + 'static,
    I: IntoIterator<Item = Effect<A>>,
{
    let mut feedback = Vec::new();
    for effect in effects {
        feedback.extend(run_effect(effect).await);
    }
    feedback
}

async fn run_effect<A>(effect: Effect<A>) -> Option<A> {
    match effect {
        Effect::None => {
            tracing::trace!("Executing Effect::None (no-op)");
            None
        },
        Effect::Future(fut) => {
            tracing::trace!("Executing Effect::Future");
            metrics::counter!("tutorlink_effects_executed_total", "type" => "future").increment(1);
            fut.await
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn collects_feedback_from_futures() {
        let effects = vec![
            Effect::None,
            Effect::Future(Box::pin(async { Some(1) })),
            Effect::Future(Box::pin(async { None })),
            Effect::Future(Box::pin(async { Some(2) })),
        ];

        assert_eq!(run_effects(effects).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn effects_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&log);
        let second = Arc::clone(&log);

        let effects: Vec<Effect<()>> = vec![
            Effect::fire_and_forget(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                first.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push("first");
            }),
            Effect::fire_and_forget(async move {
                second.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push("second");
            }),
        ];

        run_effects(effects).await;
        let log = log.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(*log, vec!["first", "second"]);
    }
}
