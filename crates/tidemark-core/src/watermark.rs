//! Watermarks — durable per-(table, entity) extraction progress.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Progress marker for one entity within one extracted table.
///
/// Invariants maintained by every [`WatermarkStore`](crate::store::WatermarkStore)
/// implementation:
///
/// - `last_observed_period` never moves backwards;
/// - a success resets `consecutive_failures` to zero;
/// - a failure only increments `consecutive_failures`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRecord {
  pub table_name:           String,
  pub entity_id:            i64,
  /// Most recent reporting period confirmed present upstream.
  pub last_observed_period: Option<NaiveDate>,
  pub last_success_at:      Option<DateTime<Utc>>,
  pub consecutive_failures: u32,
  pub updated_at:           DateTime<Utc>,
}

impl WatermarkRecord {
  /// True once the failure count has reached `max_failures`.
  pub fn is_blacklisted(&self, max_failures: u32) -> bool {
    self.consecutive_failures >= max_failures
  }

  /// True if the entity has never yielded a confirmed period or success.
  pub fn never_succeeded(&self) -> bool {
    self.last_observed_period.is_none() && self.last_success_at.is_none()
  }
}
