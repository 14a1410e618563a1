//! Extraction configuration.
//!
//! Loaded by the binary from `tidemark.toml` layered with `TIDEMARK_*`
//! environment variables (`__` separates nested keys, e.g.
//! `TIDEMARK_FETCH__API_KEY`).

use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use serde::Deserialize;
use tidemark_core::{
  period::ReportingCycle,
  screen::ScreenConfig,
  select::{BlacklistPolicy, SelectionParams},
};
use tidemark_fingerprint::{ContentFingerprinter, DEFAULT_EXCLUDED_FIELDS};
use tidemark_store_sqlite::ReportLayout;

use crate::{fetch::FetchConfig, pacer::PacingConfig, Error, Result};

/// Top-level configuration for the `tidemark` binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
  /// SQLite database path. A leading `~/` is expanded.
  #[serde(default = "default_store_path")]
  pub store_path:  PathBuf,
  #[serde(default)]
  pub fetch:       FetchConfig,
  #[serde(default)]
  pub pacing:      PacingConfig,
  #[serde(default)]
  pub screen:      ScreenConfig,
  #[serde(default)]
  pub fingerprint: FingerprintConfig,
  #[serde(default)]
  pub tables:      Vec<TableConfig>,
}

fn default_store_path() -> PathBuf { PathBuf::from("tidemark.db") }

impl ExtractConfig {
  pub fn table(&self, name: &str) -> Result<&TableConfig> {
    self
      .tables
      .iter()
      .find(|t| t.name == name)
      .ok_or_else(|| Error::UnknownTable(name.to_owned()))
  }

  pub fn store_path(&self) -> PathBuf { expand_tilde(&self.store_path) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
  /// Top-level payload fields ignored when fingerprinting.
  pub exclude_fields: Vec<String>,
}

impl Default for FingerprintConfig {
  fn default() -> Self {
    Self { exclude_fields: DEFAULT_EXCLUDED_FIELDS.iter().map(|s| (*s).to_owned()).collect() }
  }
}

impl FingerprintConfig {
  pub fn fingerprinter(&self) -> ContentFingerprinter {
    ContentFingerprinter::new(self.exclude_fields.iter().cloned())
  }
}

/// One extracted table and its selection policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TableConfig {
  pub name:                  String,
  /// Upstream function requested for this table, e.g. `BALANCE_SHEET`.
  pub function:              String,
  pub staleness_hours:       i64,
  pub max_failures:          u32,
  pub limit:                 Option<usize>,
  pub gap_detection:         bool,
  pub reporting_lag_days:    i64,
  pub cooling_off_days:      i64,
  pub pre_screen:            bool,
  pub reporting_cycle:       ReportingCycle,
  pub blacklist_policy:      BlacklistPolicy,
  pub classification_filter: Vec<String>,
  pub exchange_filter:       Vec<String>,
  pub layout:                ReportLayout,
}

impl Default for TableConfig {
  fn default() -> Self {
    Self {
      name:                  String::new(),
      function:              String::new(),
      staleness_hours:       24,
      max_failures:          3,
      limit:                 None,
      gap_detection:         true,
      reporting_lag_days:    45,
      cooling_off_days:      SelectionParams::DEFAULT_COOLING_OFF_DAYS,
      pre_screen:            true,
      reporting_cycle:       ReportingCycle::Quarterly,
      blacklist_policy:      BlacklistPolicy::Strict,
      classification_filter: Vec::new(),
      exchange_filter:       Vec::new(),
      layout:                ReportLayout::default(),
    }
  }
}

impl TableConfig {
  pub fn selection_params(&self) -> SelectionParams {
    SelectionParams {
      table_name:            self.name.clone(),
      staleness_threshold:   TimeDelta::hours(self.staleness_hours),
      max_failures:          self.max_failures,
      limit:                 self.limit,
      gap_detection_enabled: self.gap_detection,
      reporting_lag:         TimeDelta::days(self.reporting_lag_days),
      cooling_off_period:    TimeDelta::days(self.cooling_off_days),
      pre_screen_enabled:    self.pre_screen,
      reporting_cycle:       self.reporting_cycle,
      blacklist_policy:      self.blacklist_policy,
      classification_filter: self.classification_filter.clone(),
      exchange_filter:       self.exchange_filter.clone(),
    }
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use config::{Config, File, FileFormat};
  use tidemark_core::screen::ScreenRule;
  use tidemark_store_sqlite::SectionShape;

  use super::*;

  const SAMPLE: &str = r#"
store_path = "/var/lib/tidemark/tidemark.db"

[fetch]
api_key = "demo"

[pacing]
calls_per_minute = 150

[screen]
rules = ["non_primary_asset_class", "warrant"]
allow_list = ["GOOGW"]

[[tables]]
name = "balance_sheet"
function = "BALANCE_SHEET"
staleness_hours = 720
limit = 100
blacklist_policy = "never_processed_overrides"

[[tables.layout.sections]]
report_type = "quarterly"
key = "quarterlyReports"
shape = "array"
period_field = "fiscalDateEnding"

[[tables]]
name = "earnings"
function = "EARNINGS"
reporting_cycle = "annual"
gap_detection = false
"#;

  fn sample() -> ExtractConfig {
    Config::builder()
      .add_source(File::from_str(SAMPLE, FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn parses_layered_sections() {
    let cfg = sample();
    assert_eq!(cfg.fetch.api_key, "demo");
    assert_eq!(cfg.pacing.calls_per_minute, 150);
    assert_eq!(cfg.pacing.backoff_factor, 2.0);
    assert_eq!(cfg.screen.rules, vec![ScreenRule::NonPrimaryAssetClass, ScreenRule::Warrant]);
    assert_eq!(cfg.screen.max_root_len, 5);
    assert_eq!(cfg.fingerprint.exclude_fields.len(), DEFAULT_EXCLUDED_FIELDS.len());
    assert_eq!(cfg.tables.len(), 2);
  }

  #[test]
  fn table_params_carry_overrides_and_defaults() {
    let cfg = sample();
    let p = cfg.table("balance_sheet").unwrap().selection_params();
    assert_eq!(p.table_name, "balance_sheet");
    assert_eq!(p.staleness_threshold, TimeDelta::days(30));
    assert_eq!(p.limit, Some(100));
    assert_eq!(p.max_failures, 3);
    assert_eq!(p.reporting_lag, TimeDelta::days(45));
    assert_eq!(p.cooling_off_period, TimeDelta::days(7));
    assert_eq!(p.blacklist_policy, BlacklistPolicy::NeverProcessedOverrides);

    let layout = &cfg.table("balance_sheet").unwrap().layout;
    assert_eq!(layout.sections[0].shape, SectionShape::Array {
      period_field: "fiscalDateEnding".into(),
    });

    let e = cfg.table("earnings").unwrap().selection_params();
    assert_eq!(e.reporting_cycle, ReportingCycle::Annual);
    assert!(!e.gap_detection_enabled);
    assert!(e.pre_screen_enabled);
  }

  #[test]
  fn unknown_table_is_an_error() {
    assert!(matches!(sample().table("nope"), Err(Error::UnknownTable(t)) if t == "nope"));
  }

  #[test]
  fn tilde_expands_against_home() {
    let plain = Path::new("/tmp/x.db");
    assert_eq!(expand_tilde(plain), plain);
    if let Ok(home) = std::env::var("HOME") {
      assert_eq!(expand_tilde(Path::new("~/x.db")), PathBuf::from(home).join("x.db"));
    }
  }
}
