//! Fetch and attempt outcomes, and the ephemeral per-attempt record.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// What the fetch service reported for a single call.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FetchOutcome {
  Success,
  RateLimited,
  ApiFailure,
  Empty,
}

impl FetchOutcome {
  pub fn is_failure(self) -> bool { !matches!(self, Self::Success) }

  /// Parse the stored snake_case name.
  pub fn parse(s: &str) -> crate::Result<Self> {
    s.parse().map_err(|_| crate::Error::UnknownOutcome(s.to_owned()))
  }
}

/// Terminal classification of one extraction attempt.
///
/// Differs from [`FetchOutcome`] by `NoChanges`: a successful fetch whose
/// content fingerprint matched the last one stored.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptOutcome {
  Success,
  NoChanges,
  ApiFailure,
  Empty,
  RateLimited,
}

impl AttemptOutcome {
  /// Whether the watermark records this attempt as a success.
  pub fn counts_as_success(self) -> bool {
    matches!(self, Self::Success | Self::NoChanges)
  }
}

impl From<FetchOutcome> for AttemptOutcome {
  fn from(o: FetchOutcome) -> Self {
    match o {
      FetchOutcome::Success => Self::Success,
      FetchOutcome::RateLimited => Self::RateLimited,
      FetchOutcome::ApiFailure => Self::ApiFailure,
      FetchOutcome::Empty => Self::Empty,
    }
  }
}

/// Result of one extraction attempt. Not persisted beyond its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionAttempt {
  pub run_id:          Uuid,
  pub entity_id:       i64,
  pub identifier:      String,
  pub content_hash:    String,
  pub outcome:         AttemptOutcome,
  pub records_written: usize,
  pub observed_period: Option<NaiveDate>,
  /// Human-readable cause for failed attempts.
  pub error:           Option<String>,
}
