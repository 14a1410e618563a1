//! Pre-screening — static exclusion of entities structurally unlikely to
//! carry the target data category.
//!
//! Rules are explicit and named. Identifier rules operate on a parsed
//! identifier (root plus optional suffix after the first separator) rather
//! than substring wildcards, so `"GPRO"` is not mistaken for a preferred share
//! and `"ORCL"` is not mistaken for a right.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::entity::Entity;

/// Characters that split an identifier into root and suffix.
pub const SEPARATORS: &[char] = &['.', '-', '/', '+', '=', '$', '^', ' '];

// ─── Identifier parsing ──────────────────────────────────────────────────────

/// An identifier split at its first separator, upper-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIdentifier {
  pub root:      String,
  pub separator: Option<char>,
  /// Everything after the first separator; empty if the identifier ends with
  /// a separator.
  pub suffix:    Option<String>,
}

impl ParsedIdentifier {
  pub fn parse(identifier: &str) -> Self {
    let normalized = identifier.trim().to_ascii_uppercase();
    match normalized.find(SEPARATORS) {
      Some(idx) => {
        let separator = normalized[idx..].chars().next();
        let suffix = normalized[idx + 1..].to_owned();
        Self {
          root: normalized[..idx].to_owned(),
          separator,
          suffix: Some(suffix),
        }
      }
      None => Self { root: normalized, separator: None, suffix: None },
    }
  }

  /// First token of the suffix (`"WS.A"` → `"WS"`).
  pub fn suffix_head(&self) -> Option<&str> {
    self.suffix.as_deref().map(|s| s.split(SEPARATORS).next().unwrap_or(s))
  }

  /// The class of instrument implied by the suffix, if any.
  pub fn suffix_kind(&self) -> Option<SuffixKind> {
    let head = self.suffix_head()?;
    if self.separator == Some('$') {
      return Some(SuffixKind::Preferred);
    }
    let kind = match head {
      "A" | "B" | "C" | "K" => SuffixKind::ShareClass,
      "W" | "WS" | "WT" | "WTS" => SuffixKind::Warrant,
      "R" | "RT" | "RI" | "RTS" => SuffixKind::Right,
      "U" | "UN" | "UT" | "UNT" => SuffixKind::Unit,
      "P" | "PR" | "PFD" => SuffixKind::Preferred,
      h if h.len() == 2 && h.starts_with('P') => SuffixKind::Preferred,
      _ => SuffixKind::Other,
    };
    Some(kind)
  }

  /// NASDAQ fifth-letter code: a bare five-letter root whose last letter marks
  /// the instrument type.
  pub fn fifth_letter(&self) -> Option<char> {
    if self.suffix.is_some() || self.root.len() != 5 {
      return None;
    }
    if !self.root.chars().all(|c| c.is_ascii_alphabetic()) {
      return None;
    }
    self.root.chars().last()
  }
}

/// Instrument class implied by an identifier suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixKind {
  ShareClass,
  Warrant,
  Right,
  Unit,
  Preferred,
  Other,
}

// ─── Rules ───────────────────────────────────────────────────────────────────

/// A single named exclusion rule.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  EnumIter,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScreenRule {
  NonPrimaryAssetClass,
  SingleCharacter,
  LongIdentifier,
  Warrant,
  Right,
  Unit,
  Preferred,
  ComplexIdentifier,
}

impl ScreenRule {
  /// Rules enabled when configuration does not list any.
  ///
  /// `SingleCharacter` is opt-in: single-letter tickers are common among
  /// large listed companies (`F`, `T`, `V`).
  pub fn defaults() -> Vec<Self> {
    Self::iter().filter(|r| *r != Self::SingleCharacter).collect()
  }

  /// Rules that look only at the identifier's format. Allow-listed
  /// identifiers bypass these.
  pub fn is_identifier_rule(self) -> bool { !matches!(self, Self::NonPrimaryAssetClass) }

  /// Stable reason string used in exclusion reports.
  pub fn reason(self) -> &'static str { self.into() }

  pub fn evaluate(self, entity: &Entity, filter: &PreScreenFilter) -> Verdict {
    let parsed = ParsedIdentifier::parse(&entity.identifier);
    let excluded = match self {
      Self::NonPrimaryAssetClass => {
        !filter.primary_classes.is_empty()
          && !filter
            .primary_classes
            .contains(&entity.classification.trim().to_ascii_lowercase())
      }
      Self::SingleCharacter => parsed.suffix.is_none() && parsed.root.chars().count() == 1,
      Self::LongIdentifier => parsed.root.chars().count() > filter.max_root_len,
      Self::Warrant => {
        parsed.suffix_kind() == Some(SuffixKind::Warrant) || parsed.fifth_letter() == Some('W')
      }
      Self::Right => {
        parsed.suffix_kind() == Some(SuffixKind::Right) || parsed.fifth_letter() == Some('R')
      }
      Self::Unit => {
        parsed.suffix_kind() == Some(SuffixKind::Unit) || parsed.fifth_letter() == Some('U')
      }
      Self::Preferred => {
        parsed.suffix_kind() == Some(SuffixKind::Preferred) || parsed.fifth_letter() == Some('P')
      }
      Self::ComplexIdentifier => {
        parsed.root.is_empty()
          || !parsed.root.chars().all(|c| c.is_ascii_alphanumeric())
          || matches!(parsed.suffix.as_deref(), Some(""))
          || parsed.suffix_kind() == Some(SuffixKind::Other)
      }
    };
    Verdict { excluded, reason: self.reason() }
  }
}

/// Result of one rule applied to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
  pub excluded: bool,
  pub reason:   &'static str,
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Serde-facing filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
  pub rules:           Vec<ScreenRule>,
  /// Asset classes considered primary (case-insensitive).
  pub primary_classes: Vec<String>,
  pub max_root_len:    usize,
  /// Identifiers exempt from the identifier-format rules.
  pub allow_list:      Vec<String>,
}

impl Default for ScreenConfig {
  fn default() -> Self {
    Self {
      rules:           ScreenRule::defaults(),
      primary_classes: vec!["Stock".into()],
      max_root_len:    5,
      allow_list:      Vec::new(),
    }
  }
}

// ─── Filter ──────────────────────────────────────────────────────────────────

/// Aggregated rule outcome for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Screening {
  pub excluded: bool,
  pub reasons:  Vec<&'static str>,
}

/// Entities split by the filter, with per-reason counts.
#[derive(Debug, Clone, Default)]
pub struct ScreenReport {
  pub eligible:      Vec<Entity>,
  pub excluded:      Vec<(Entity, Vec<&'static str>)>,
  pub reason_counts: BTreeMap<&'static str, usize>,
}

impl ScreenReport {
  /// Fraction of entities that passed, in `[0, 1]`.
  pub fn eligibility_rate(&self) -> f64 {
    let total = self.eligible.len() + self.excluded.len();
    if total == 0 { 1.0 } else { self.eligible.len() as f64 / total as f64 }
  }
}

/// The configured pre-screen rule set.
#[derive(Debug, Clone)]
pub struct PreScreenFilter {
  rules:           Vec<ScreenRule>,
  primary_classes: BTreeSet<String>,
  max_root_len:    usize,
  allow_list:      BTreeSet<String>,
}

impl Default for PreScreenFilter {
  fn default() -> Self { Self::new(ScreenConfig::default()) }
}

impl PreScreenFilter {
  pub fn new(config: ScreenConfig) -> Self {
    let mut rules = config.rules;
    rules.sort();
    rules.dedup();
    Self {
      rules,
      primary_classes: config
        .primary_classes
        .iter()
        .map(|c| c.trim().to_ascii_lowercase())
        .collect(),
      max_root_len: config.max_root_len,
      allow_list: config
        .allow_list
        .iter()
        .map(|s| s.trim().to_ascii_uppercase())
        .collect(),
    }
  }

  pub fn rules(&self) -> &[ScreenRule] { &self.rules }

  pub fn is_allow_listed(&self, identifier: &str) -> bool {
    self.allow_list.contains(&identifier.trim().to_ascii_uppercase())
  }

  /// Apply every enabled rule and collect the reasons that fired.
  pub fn screen(&self, entity: &Entity) -> Screening {
    let allowed = self.is_allow_listed(&entity.identifier);
    let reasons: Vec<&'static str> = self
      .rules
      .iter()
      .filter(|rule| !(allowed && rule.is_identifier_rule()))
      .map(|rule| rule.evaluate(entity, self))
      .filter(|verdict| verdict.excluded)
      .map(|verdict| verdict.reason)
      .collect();
    Screening { excluded: !reasons.is_empty(), reasons }
  }

  pub fn partition(&self, entities: impl IntoIterator<Item = Entity>) -> ScreenReport {
    let mut report = ScreenReport::default();
    for entity in entities {
      let screening = self.screen(&entity);
      if screening.excluded {
        for reason in &screening.reasons {
          *report.reason_counts.entry(*reason).or_default() += 1;
        }
        report.excluded.push((entity, screening.reasons));
      } else {
        report.eligible.push(entity);
      }
    }
    report
  }
}
