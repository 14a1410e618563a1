//! Reporting-period arithmetic.
//!
//! Given the current date and the assumed publication lag, decide which
//! reporting period should already be visible upstream. Everything here is
//! pure and total: any input yields a definite date, so a misconfigured lag or
//! a skewed clock can only over- or under-select, never fail.

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A fixed-length reporting cycle aligned to 1 January.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReportingCycle {
  Monthly,
  #[default]
  Quarterly,
  SemiAnnual,
  Annual,
}

impl ReportingCycle {
  pub fn months(self) -> u32 {
    match self {
      Self::Monthly => 1,
      Self::Quarterly => 3,
      Self::SemiAnnual => 6,
      Self::Annual => 12,
    }
  }

  /// First day of the cycle containing `date`.
  pub fn cycle_start(self, date: NaiveDate) -> NaiveDate {
    let months = self.months();
    let month0 = (date.month0() / months) * months;
    NaiveDate::from_ymd_opt(date.year(), month0 + 1, 1).unwrap_or(date)
  }

  /// Last day of the most recent cycle whose data should be published by
  /// `today`, assuming publication `lag` after the cycle closes.
  ///
  /// Once `today` reaches `cycle_start + lag`, the previous cycle counts as
  /// published. Before that, the cycle before the previous one is the best
  /// guaranteed-published period.
  pub fn expected_period_end(self, today: NaiveDate, lag: TimeDelta) -> NaiveDate {
    let start = self.cycle_start(today);
    let published_from = start.checked_add_signed(lag).unwrap_or(NaiveDate::MAX);

    let first_unpublished = if today >= published_from {
      start
    } else {
      start
        .checked_sub_months(Months::new(self.months()))
        .unwrap_or(NaiveDate::MIN)
    };

    first_unpublished.pred_opt().unwrap_or(NaiveDate::MIN)
  }
}

/// Quarterly [`ReportingCycle::expected_period_end`] evaluated at `now`.
pub fn expected_period_end(now: DateTime<Utc>, lag: TimeDelta) -> NaiveDate {
  ReportingCycle::Quarterly.expected_period_end(now.date_naive(), lag)
}
