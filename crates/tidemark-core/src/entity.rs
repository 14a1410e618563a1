//! Entity — one row of the external registry (e.g. a ticker symbol).
//!
//! Entities are owned by the registry; the extraction subsystem only reads
//! them. Their status and delisting date decide whether the entity's
//! historical window is still open.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Listing status of an entity.
///
/// Unknown registry values are preserved verbatim in [`EntityStatus::Other`]
/// and are never selected for extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityStatus {
  Active,
  Delisted,
  Other(String),
}

impl EntityStatus {
  pub fn as_str(&self) -> &str {
    match self {
      Self::Active => "active",
      Self::Delisted => "delisted",
      Self::Other(s) => s,
    }
  }
}

impl From<&str> for EntityStatus {
  fn from(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "active" => Self::Active,
      "delisted" => Self::Delisted,
      _ => Self::Other(s.trim().to_owned()),
    }
  }
}

impl From<String> for EntityStatus {
  fn from(s: String) -> Self { Self::from(s.as_str()) }
}

impl From<EntityStatus> for String {
  fn from(s: EntityStatus) -> Self { s.as_str().to_owned() }
}

impl fmt::Display for EntityStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A tracked instrument from the entity registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
  pub id:             i64,
  /// Symbol passed to the fetch service (e.g. `"AAPL"`).
  pub identifier:     String,
  /// Asset class as reported by the registry (e.g. `"Stock"`, `"ETF"`).
  pub classification: String,
  #[serde(default)]
  pub exchange:       Option<String>,
  pub status:         EntityStatus,
  #[serde(default)]
  pub delisting_date: Option<NaiveDate>,
}

impl Entity {
  /// Convenience constructor for an active entity with no exchange.
  pub fn active(
    id: i64,
    identifier: impl Into<String>,
    classification: impl Into<String>,
  ) -> Self {
    Self {
      id,
      identifier: identifier.into(),
      classification: classification.into(),
      exchange: None,
      status: EntityStatus::Active,
      delisting_date: None,
    }
  }
}
