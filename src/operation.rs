use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// End of a window of `length` starting at `start`, or `None` when it lies
/// past the last representable date.
#[must_use]
pub fn window_end(start: OffsetDateTime, length: Duration) -> Option<OffsetDateTime> {
    time::Duration::try_from(length)
        .ok()
        .and_then(|length| start.checked_add(length))
}

/// Workflow position of a [`CreateOperation`].
///
/// Variants are ordered: a record at a later stage has passed every earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Authorized,
    Responded,
    Issued,
    Uploaded,
    Mapped,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Authorized,
        Stage::Responded,
        Stage::Issued,
        Stage::Uploaded,
        Stage::Mapped,
    ];

    /// Returns the only stage reachable from `self`, if any.
    #[must_use]
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Authorized => Some(Stage::Responded),
            Stage::Responded => Some(Stage::Issued),
            Stage::Issued => Some(Stage::Uploaded),
            Stage::Uploaded => Some(Stage::Mapped),
            Stage::Mapped => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Authorized => "authorized",
            Stage::Responded => "responded",
            Stage::Issued => "issued",
            Stage::Uploaded => "uploaded",
            Stage::Mapped => "mapped",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid stage transition from {from} to {to}")]
pub struct TransitionError {
    pub from: Stage,
    pub to: Stage,
}

/// Durable state of one certificate request, keyed by the challenge token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOperation {
    pub hostname: String,
    pub token: String,
    pub authorization_uri: String,
    pub challenge_uri: String,
    pub response: String,
    pub stage: Stage,
    #[serde(with = "time::serde::rfc3339")]
    pub accepted: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub responded: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub issued: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub uploaded: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub mapped: Option<OffsetDateTime>,
    /// Last failure message. Left in place when a later attempt succeeds.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub mapped_certificate_id: Option<String>,
    #[serde(default)]
    pub is_finished: bool,
}

impl CreateOperation {
    #[must_use]
    pub fn new(
        hostname: impl Into<String>,
        token: impl Into<String>,
        authorization_uri: impl Into<String>,
        challenge_uri: impl Into<String>,
        response: impl Into<String>,
        accepted: OffsetDateTime,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            token: token.into(),
            authorization_uri: authorization_uri.into(),
            challenge_uri: challenge_uri.into(),
            response: response.into(),
            stage: Stage::Authorized,
            accepted,
            responded: None,
            issued: None,
            uploaded: None,
            mapped: None,
            error: None,
            mapped_certificate_id: None,
            is_finished: false,
        }
    }

    #[must_use]
    pub fn timestamp(&self, stage: Stage) -> Option<OffsetDateTime> {
        match stage {
            Stage::Authorized => Some(self.accepted),
            Stage::Responded => self.responded,
            Stage::Issued => self.issued,
            Stage::Uploaded => self.uploaded,
            Stage::Mapped => self.mapped,
        }
    }

    #[must_use]
    pub fn has_reached(&self, stage: Stage) -> bool {
        self.stage >= stage
    }

    /// Moves the record to `to`, stamping the stage time.
    ///
    /// The stamp never precedes the previous stage's stamp, so timestamps stay
    /// monotonic even if the wall clock steps backwards between tasks.
    ///
    /// # Errors
    /// Returns [`TransitionError`] unless `to` directly follows the current stage.
    pub fn advance(&mut self, to: Stage, now: OffsetDateTime) -> Result<(), TransitionError> {
        if self.stage.next() != Some(to) {
            return Err(TransitionError {
                from: self.stage,
                to,
            });
        }
        let previous = self.timestamp(self.stage).unwrap_or(self.accepted);
        let at = now.max(previous);
        match to {
            Stage::Authorized => {}
            Stage::Responded => self.responded = Some(at),
            Stage::Issued => self.issued = Some(at),
            Stage::Uploaded => self.uploaded = Some(at),
            Stage::Mapped => self.mapped = Some(at),
        }
        self.stage = to;
        Ok(())
    }

    /// Records a successful mapping, which also finishes the workflow.
    ///
    /// # Errors
    /// Returns [`TransitionError`] if the certificate has not been uploaded yet.
    pub fn complete_mapping(
        &mut self,
        certificate_id: impl Into<String>,
        now: OffsetDateTime,
    ) -> Result<(), TransitionError> {
        self.advance(Stage::Mapped, now)?;
        self.mapped_certificate_id = Some(certificate_id.into());
        self.is_finished = true;
        Ok(())
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// True while the workflow is unfinished and still inside the soft-expiry window.
    #[must_use]
    pub fn is_ongoing(&self, now: OffsetDateTime, soft_expiry: Duration) -> bool {
        !self.is_finished && window_end(self.accepted, soft_expiry).is_none_or(|end| now <= end)
    }

    /// True once the record is old enough for the cleanup sweep.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime, hard_expiry: Duration) -> bool {
        window_end(self.accepted, hard_expiry).is_some_and(|end| end < now)
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped_certificate_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }

    /// Checks that every set timestamp has all earlier ones set and in order.
    #[must_use]
    pub fn timestamps_are_consistent(&self) -> bool {
        let mut previous = Some(self.accepted);
        for stage in Stage::ALL {
            let current = self.timestamp(stage);
            let reached = self.has_reached(stage);
            if reached != current.is_some() {
                return false;
            }
            match (previous, current) {
                (None, Some(_)) => return false,
                (Some(earlier), Some(later)) if later < earlier => return false,
                _ => {}
            }
            previous = current;
        }
        !self.is_mapped() || self.is_finished
    }
}
