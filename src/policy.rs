use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

use crate::operation::{CreateOperation, TransitionError};
use crate::task::Enqueue;

/// Successful result of one deferred stage.
#[derive(Debug)]
pub enum StageOutcome {
    /// The stage completed and the next stage should run.
    Advance(Enqueue),
    /// The workflow completed.
    Finished,
    /// An earlier invocation already completed this stage.
    AlreadyDone,
}

#[derive(Debug, Error)]
pub enum StageError {
    /// Transient fault; the scheduler re-runs the stage.
    #[error("{0:#}")]
    Retryable(anyhow::Error),
    /// The CA rejected the request; the workflow stops.
    #[error("{0}")]
    Rejected(String),
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(err)
    }
}

impl From<TransitionError> for StageError {
    fn from(err: TransitionError) -> Self {
        Self::Retryable(err.into())
    }
}

/// Attempt budget and backoff shared by the scheduler and the outcome wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts a task gets.
    pub retry_ceiling: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following the one with `retry_count` prior retries.
    #[must_use]
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.min_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// True when the attempt with `retry_count` prior retries is the last one.
    #[must_use]
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count.saturating_add(1) >= self.retry_ceiling
    }

    /// Applies a stage result to the record and decides what the scheduler sees.
    ///
    /// The caller persists `operation` afterwards regardless of the result.
    ///
    /// # Errors
    /// Returns the stage's error when it is retryable, so the scheduler retries it.
    pub fn settle(
        &self,
        operation: &mut CreateOperation,
        result: Result<StageOutcome, StageError>,
        retry_count: u32,
    ) -> anyhow::Result<Option<Enqueue>> {
        match result {
            Ok(StageOutcome::Advance(next)) => Ok(Some(next)),
            Ok(StageOutcome::Finished) => {
                operation.is_finished = true;
                Ok(None)
            }
            Ok(StageOutcome::AlreadyDone) => Ok(None),
            Err(StageError::Rejected(message)) => {
                warn!(
                    "Operation {} for {} rejected by CA: {}",
                    operation.token, operation.hostname, message
                );
                operation.record_error(message);
                operation.is_finished = true;
                Ok(None)
            }
            Err(StageError::Retryable(err)) => {
                operation.record_error(format!("{err:#}"));
                if self.is_exhausted(retry_count) {
                    warn!(
                        "Operation {} for {} gave up after {} attempts",
                        operation.token,
                        operation.hostname,
                        retry_count.saturating_add(1)
                    );
                    operation.is_finished = true;
                }
                Err(err)
            }
        }
    }
}

/// Windows after `accepted` that govern status display and deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub soft: Duration,
    pub hard: Duration,
}

impl ExpiryPolicy {
    #[must_use]
    pub fn is_ongoing(&self, operation: &CreateOperation, now: OffsetDateTime) -> bool {
        operation.is_ongoing(now, self.soft)
    }

    #[must_use]
    pub fn is_expired(&self, operation: &CreateOperation, now: OffsetDateTime) -> bool {
        operation.is_expired(now, self.hard)
    }
}

/// Decides whether a request should also run the expiry sweep.
pub trait CleanupTrigger: Send + Sync {
    fn should_clean(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct Probabilistic {
    probability: f64,
}

impl Probabilistic {
    #[must_use]
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }
}

impl CleanupTrigger for Probabilistic {
    fn should_clean(&self) -> bool {
        rand::thread_rng().gen_bool(self.probability)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Always;

impl CleanupTrigger for Always {
    fn should_clean(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Never;

impl CleanupTrigger for Never {
    fn should_clean(&self) -> bool {
        false
    }
}
