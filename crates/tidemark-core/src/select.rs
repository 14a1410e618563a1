//! Eligibility selection — which entities are worth a call this run, and in
//! what order.
//!
//! The selector is pure: it receives every registry entity joined with its
//! watermark (see [`WatermarkStore::candidate_rows`]) plus the current time,
//! and returns a deterministically ordered candidate list together with
//! counts of why everything else was left out.
//!
//! [`WatermarkStore::candidate_rows`]: crate::store::WatermarkStore::candidate_rows

use std::{cmp::Ordering, collections::BTreeMap};

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  entity::{Entity, EntityStatus},
  period::ReportingCycle,
  screen::PreScreenFilter,
  watermark::WatermarkRecord,
};

// ─── Parameters ──────────────────────────────────────────────────────────────

/// How the failure blacklist interacts with never-processed entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistPolicy {
  /// `consecutive_failures >= max_failures` always excludes.
  #[default]
  Strict,
  /// Entities that have never succeeded stay eligible regardless of their
  /// failure count.
  NeverProcessedOverrides,
}

/// Inputs to one selection pass.
#[derive(Debug, Clone)]
pub struct SelectionParams {
  pub table_name:            String,
  pub staleness_threshold:   TimeDelta,
  pub max_failures:          u32,
  pub limit:                 Option<usize>,
  pub gap_detection_enabled: bool,
  pub reporting_lag:         TimeDelta,
  pub cooling_off_period:    TimeDelta,
  pub pre_screen_enabled:    bool,
  pub reporting_cycle:       ReportingCycle,
  pub blacklist_policy:      BlacklistPolicy,
  /// If non-empty, only entities with one of these classifications.
  pub classification_filter: Vec<String>,
  /// If non-empty, only entities listed on one of these exchanges.
  pub exchange_filter:       Vec<String>,
}

impl SelectionParams {
  pub const DEFAULT_COOLING_OFF_DAYS: i64 = 7;

  pub fn new(table_name: impl Into<String>) -> Self {
    Self {
      table_name:            table_name.into(),
      staleness_threshold:   TimeDelta::hours(24),
      max_failures:          3,
      limit:                 None,
      gap_detection_enabled: true,
      reporting_lag:         TimeDelta::days(45),
      cooling_off_period:    TimeDelta::days(Self::DEFAULT_COOLING_OFF_DAYS),
      pre_screen_enabled:    true,
      reporting_cycle:       ReportingCycle::Quarterly,
      blacklist_policy:      BlacklistPolicy::Strict,
      classification_filter: Vec::new(),
      exchange_filter:       Vec::new(),
    }
  }
}

// ─── Rows and results ────────────────────────────────────────────────────────

/// A registry entity joined with its watermark for the table being selected.
#[derive(Debug, Clone)]
pub struct CandidateRow {
  pub entity:    Entity,
  pub watermark: Option<WatermarkRecord>,
}

/// Why an entity is worth calling. Lower sorts first.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  /// No period has ever been confirmed.
  NeverProcessed = 0,
  /// The confirmed period lags the expected published period.
  PeriodGap      = 1,
  /// The last success is older than the staleness threshold.
  Stale          = 2,
}

/// Why an entity was left out of the candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
  /// Status is neither active nor delisted.
  Inactive,
  /// Delisted, and a success was recorded on or after the delisting date.
  DelistingWindowClosed,
  /// Outside the configured classification or exchange filter.
  Filtered,
  Screened(Vec<&'static str>),
  Blacklisted,
  /// Has a period gap, but succeeded within the cooling-off window.
  CoolingOff,
  UpToDate,
}

/// The decision for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
  Selected(Priority),
  Excluded(Exclusion),
}

/// One entity chosen for processing.
#[derive(Debug, Clone)]
pub struct Candidate {
  pub entity:    Entity,
  pub watermark: Option<WatermarkRecord>,
  pub priority:  Priority,
}

impl Candidate {
  fn last_success_at(&self) -> Option<DateTime<Utc>> {
    self.watermark.as_ref().and_then(|w| w.last_success_at)
  }
}

/// Counts of how the universe was narrowed down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionStats {
  pub universe:                usize,
  pub inactive:                usize,
  pub delisting_window_closed: usize,
  pub filtered:                usize,
  pub screened:                usize,
  pub screen_reasons:          BTreeMap<&'static str, usize>,
  pub blacklisted:             usize,
  pub cooling_off:             usize,
  pub up_to_date:              usize,
  pub truncated:               usize,
  pub selected:                usize,
  pub by_priority:             BTreeMap<Priority, usize>,
}

/// Ordered candidates plus bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Selection {
  pub candidates:            Vec<Candidate>,
  pub stats:                 SelectionStats,
  /// The expected period end used for gap detection this pass.
  pub expected_period_end:   Option<NaiveDate>,
}

impl Selection {
  pub fn entity_ids(&self) -> Vec<i64> {
    self.candidates.iter().map(|c| c.entity.id).collect()
  }
}

// ─── Selector ────────────────────────────────────────────────────────────────

/// Composes the pre-screen filter with watermark state and period-gap logic.
#[derive(Debug, Clone, Default)]
pub struct EligibilitySelector {
  filter: PreScreenFilter,
}

impl EligibilitySelector {
  pub fn new(filter: PreScreenFilter) -> Self { Self { filter } }

  pub fn filter(&self) -> &PreScreenFilter { &self.filter }

  /// Decide a single row.
  pub fn classify(
    &self,
    row: &CandidateRow,
    params: &SelectionParams,
    now: DateTime<Utc>,
  ) -> Eligibility {
    let entity = &row.entity;
    let watermark = row.watermark.as_ref();
    let last_success_at = watermark.and_then(|w| w.last_success_at);

    match &entity.status {
      EntityStatus::Active => {}
      // Without a delisting date, any success closes the window.
      EntityStatus::Delisted => {
        let closed = match (entity.delisting_date, last_success_at) {
          (_, None) => false,
          (None, Some(_)) => true,
          (Some(delisted_on), Some(succeeded_at)) => succeeded_at.date_naive() >= delisted_on,
        };
        if closed {
          return Eligibility::Excluded(Exclusion::DelistingWindowClosed);
        }
      }
      EntityStatus::Other(_) => return Eligibility::Excluded(Exclusion::Inactive),
    }

    if !passes_filter(&params.classification_filter, Some(&entity.classification))
      || !passes_filter(&params.exchange_filter, entity.exchange.as_ref())
    {
      return Eligibility::Excluded(Exclusion::Filtered);
    }

    if params.pre_screen_enabled {
      let screening = self.filter.screen(entity);
      if screening.excluded {
        return Eligibility::Excluded(Exclusion::Screened(screening.reasons));
      }
    }

    if let Some(w) = watermark
      && w.is_blacklisted(params.max_failures)
    {
      let overridden =
        params.blacklist_policy == BlacklistPolicy::NeverProcessedOverrides && w.never_succeeded();
      if !overridden {
        return Eligibility::Excluded(Exclusion::Blacklisted);
      }
    }

    let since_success = last_success_at.map(|at| now - at);
    let cooling = since_success.is_some_and(|elapsed| elapsed < params.cooling_off_period);
    let last_period = watermark.and_then(|w| w.last_observed_period);

    // Priority 0 is narrower than "no observed period": a success that
    // confirmed no period still starts the cooling-off clock, and until it
    // expires the entity falls through to the staleness check below.
    if last_period.is_none() && !cooling {
      return Eligibility::Selected(Priority::NeverProcessed);
    }

    let mut gap_suppressed = false;
    if params.gap_detection_enabled
      && let Some(period) = last_period
    {
      let expected = params
        .reporting_cycle
        .expected_period_end(now.date_naive(), params.reporting_lag);
      if period < expected {
        if cooling {
          gap_suppressed = true;
        } else {
          return Eligibility::Selected(Priority::PeriodGap);
        }
      }
    }

    let stale = since_success.is_none_or(|elapsed| elapsed >= params.staleness_threshold);
    if stale {
      return Eligibility::Selected(Priority::Stale);
    }

    if gap_suppressed || last_period.is_none() {
      Eligibility::Excluded(Exclusion::CoolingOff)
    } else {
      Eligibility::Excluded(Exclusion::UpToDate)
    }
  }

  /// Produce the ordered candidate list for `params.table_name`.
  pub fn select(
    &self,
    rows: Vec<CandidateRow>,
    params: &SelectionParams,
    now: DateTime<Utc>,
  ) -> Selection {
    let mut stats = SelectionStats { universe: rows.len(), ..SelectionStats::default() };
    let mut candidates = Vec::new();

    for row in rows {
      match self.classify(&row, params, now) {
        Eligibility::Selected(priority) => candidates.push(Candidate {
          entity: row.entity,
          watermark: row.watermark,
          priority,
        }),
        Eligibility::Excluded(exclusion) => match exclusion {
          Exclusion::Inactive => stats.inactive += 1,
          Exclusion::DelistingWindowClosed => stats.delisting_window_closed += 1,
          Exclusion::Filtered => stats.filtered += 1,
          Exclusion::Screened(reasons) => {
            stats.screened += 1;
            for reason in reasons {
              *stats.screen_reasons.entry(reason).or_default() += 1;
            }
          }
          Exclusion::Blacklisted => stats.blacklisted += 1,
          Exclusion::CoolingOff => stats.cooling_off += 1,
          Exclusion::UpToDate => stats.up_to_date += 1,
        },
      }
    }

    candidates.sort_by(compare_candidates);

    if let Some(limit) = params.limit
      && candidates.len() > limit
    {
      stats.truncated = candidates.len() - limit;
      candidates.truncate(limit);
    }

    stats.selected = candidates.len();
    for c in &candidates {
      *stats.by_priority.entry(c.priority).or_default() += 1;
    }

    let expected_period_end = params.gap_detection_enabled.then(|| {
      params
        .reporting_cycle
        .expected_period_end(now.date_naive(), params.reporting_lag)
    });

    Selection { candidates, stats, expected_period_end }
  }
}

fn passes_filter(allowed: &[String], value: Option<&String>) -> bool {
  if allowed.is_empty() {
    return true;
  }
  value.is_some_and(|v| allowed.iter().any(|a| a.eq_ignore_ascii_case(v.trim())))
}

/// `(priority, last_success_at nulls first, identifier length, identifier)`.
fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
  a.priority
    .cmp(&b.priority)
    .then_with(|| a.last_success_at().cmp(&b.last_success_at()))
    .then_with(|| a.entity.identifier.len().cmp(&b.entity.identifier.len()))
    .then_with(|| a.entity.identifier.cmp(&b.entity.identifier))
}
