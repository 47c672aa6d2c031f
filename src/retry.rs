//! Conflict retry machinery.
//!
//! Backend deadlocks and optimistic version conflicts are retried a bounded
//! number of times with randomized backoff before the error surfaces. The
//! conflict predicate is pluggable so relational backends can match their
//! driver's deadlock signatures (MySQL 1205/1213, a `DEADLOCK` marker for
//! SQLite test harnesses) without the core hard-coding them.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::DEFAULT_RETRY_ATTEMPTS;
use crate::error::{CoreError, CoreResult};

/// Decides whether an error is a retryable conflict.
pub type ConflictPredicate = Arc<dyn Fn(&CoreError) -> bool + Send + Sync>;

/// Bounded retry with jittered backoff.
#[derive(Clone)]
pub struct RetryPolicy {
    attempts: u32,
    predicate: ConflictPredicate,
}

impl RetryPolicy {
    /// Policy retrying up to `attempts` additional times on conflicts
    /// matched by the default predicate (backend deadlocks).
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            predicate: Arc::new(|error| matches!(error, CoreError::Deadlock(_))),
        }
    }

    /// Replace the conflict predicate.
    pub fn with_predicate(mut self, predicate: ConflictPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Maximum number of additional attempts.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True when the predicate classifies the error as a retryable
    /// conflict.
    pub fn is_conflict(&self, error: &CoreError) -> bool {
        (self.predicate)(error)
    }

    /// Run `operation`, retrying on conflicts until the attempts are
    /// exhausted, then surface the error.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if (self.predicate)(&error) && attempt < self.attempts => {
                    attempt += 1;
                    log::warn!(
                        "conflict detected, trying again (attempt #{}): {}",
                        attempt,
                        error
                    );
                    tokio::time::sleep(backoff()).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_ATTEMPTS)
    }
}

/// Uniform random backoff between 0 and 1 second.
pub fn backoff() -> Duration {
    let millis = rand::thread_rng().gen_range(0..1000);
    Duration::from_millis(millis)
}
