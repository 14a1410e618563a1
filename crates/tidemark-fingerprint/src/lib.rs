//! Content fingerprints for change detection.
//!
//! A fingerprint is the SHA-256 of a record's canonical encoding (see
//! [`canonical`]) with volatile metadata fields removed. Two fetches of the
//! same upstream data therefore hash identically even though their run ids
//! and timestamps differ, which lets the coordinator skip redundant writes.

pub mod canonical;
pub mod error;

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tidemark_core::store::FingerprintStore;

pub use error::{Error, Result};

/// Top-level fields that never contribute to a fingerprint by default.
pub const DEFAULT_EXCLUDED_FIELDS: &[&str] = &[
  "created_at",
  "updated_at",
  "fetched_at",
  "run_id",
  "source_run_id",
  "landing_id",
  "api_response_status",
];

/// Lowercase hex SHA-256 of a canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn as_str(&self) -> &str { &self.0 }

  pub fn into_string(self) -> String { self.0 }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl PartialEq<str> for Fingerprint {
  fn eq(&self, other: &str) -> bool { self.0 == other }
}

// ─── Fingerprinter ───────────────────────────────────────────────────────────

/// Hashes records with a fixed set of excluded fields.
#[derive(Debug, Clone)]
pub struct ContentFingerprinter {
  exclude_fields: Vec<String>,
}

impl Default for ContentFingerprinter {
  fn default() -> Self { Self::new(DEFAULT_EXCLUDED_FIELDS.iter().copied()) }
}

impl ContentFingerprinter {
  pub fn new<I, S>(exclude_fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut exclude_fields: Vec<String> = exclude_fields.into_iter().map(Into::into).collect();
    exclude_fields.sort();
    exclude_fields.dedup();
    Self { exclude_fields }
  }

  pub fn exclude_fields(&self) -> &[String] { &self.exclude_fields }

  /// Fingerprint any serialisable record.
  pub fn fingerprint<T: Serialize + ?Sized>(&self, record: &T) -> Result<Fingerprint> {
    let value = serde_json::to_value(record)?;
    Ok(self.fingerprint_value(&value))
  }

  /// Fingerprint an already-parsed JSON value.
  pub fn fingerprint_value(&self, value: &serde_json::Value) -> Fingerprint {
    let exclude: Vec<&str> = self.exclude_fields.iter().map(String::as_str).collect();
    let bytes = canonical::encode(value, &exclude);
    Fingerprint(hex::encode(Sha256::digest(&bytes)))
  }
}

/// True if no fingerprint is stored for `(table, entity_id)`, or the stored
/// one differs from `hash`.
pub async fn has_changed<S: FingerprintStore>(
  store: &S,
  table: &str,
  entity_id: i64,
  hash: &Fingerprint,
) -> Result<bool, S::Error> {
  let previous = store.last_fingerprint(table, entity_id).await?;
  Ok(previous.as_deref() != Some(hash.as_str()))
}

#[cfg(test)]
mod tests {
  use std::{collections::HashMap, convert::Infallible, sync::Mutex};

  use chrono::{DateTime, Utc};
  use serde_json::json;

  use super::*;

  #[derive(Default)]
  struct MemoryFingerprints(Mutex<HashMap<(String, i64), String>>);

  impl FingerprintStore for MemoryFingerprints {
    type Error = Infallible;

    async fn last_fingerprint(&self, table: &str, entity_id: i64) -> Result<Option<String>, Infallible> {
      Ok(self.0.lock().unwrap().get(&(table.to_owned(), entity_id)).cloned())
    }

    async fn record_fingerprint(
      &self,
      table: &str,
      entity_id: i64,
      content_hash: &str,
      _at: DateTime<Utc>,
    ) -> Result<(), Infallible> {
      self
        .0
        .lock()
        .unwrap()
        .insert((table.to_owned(), entity_id), content_hash.to_owned());
      Ok(())
    }
  }

  #[derive(Serialize)]
  struct Report {
    symbol:       &'static str,
    total_assets: i64,
    run_id:       &'static str,
    fetched_at:   &'static str,
  }

  #[test]
  fn metadata_does_not_affect_fingerprint() {
    let f = ContentFingerprinter::default();
    let a = Report {
      symbol:       "AAPL",
      total_assets: 100,
      run_id:       "run-1",
      fetched_at:   "2025-01-01T00:00:00Z",
    };
    let b = Report {
      symbol:       "AAPL",
      total_assets: 100,
      run_id:       "run-2",
      fetched_at:   "2025-02-01T00:00:00Z",
    };
    assert_eq!(f.fingerprint(&a).unwrap(), f.fingerprint(&b).unwrap());
  }

  #[test]
  fn business_field_change_changes_fingerprint() {
    let f = ContentFingerprinter::default();
    let a = json!({ "symbol": "AAPL", "reports": [{ "period": "2025-03-31", "value": "100" }] });
    let b = json!({ "symbol": "AAPL", "reports": [{ "period": "2025-03-31", "value": "101" }] });
    assert_ne!(f.fingerprint_value(&a), f.fingerprint_value(&b));
  }

  #[test]
  fn fingerprint_is_stable_hex_sha256() {
    let f = ContentFingerprinter::default();
    let value = json!({ "b": [1, 2.5, null], "a": "x" });
    let first = f.fingerprint_value(&value);
    assert_eq!(first.as_str().len(), 64);
    assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    for _ in 0..10 {
      assert_eq!(f.fingerprint_value(&value), first);
    }
  }

  #[test]
  fn custom_exclusions_replace_defaults() {
    let f = ContentFingerprinter::new(["as_of"]);
    let a = json!({ "value": 1, "as_of": "today", "run_id": "1" });
    let b = json!({ "value": 1, "as_of": "tomorrow", "run_id": "1" });
    let c = json!({ "value": 1, "as_of": "today", "run_id": "2" });
    assert_eq!(f.fingerprint_value(&a), f.fingerprint_value(&b));
    assert_ne!(f.fingerprint_value(&a), f.fingerprint_value(&c));
  }

  #[tokio::test]
  async fn has_changed_against_store() {
    let store = MemoryFingerprints::default();
    let f = ContentFingerprinter::default();
    let hash = f.fingerprint_value(&json!({ "value": 1 }));
    let other = f.fingerprint_value(&json!({ "value": 2 }));

    assert!(has_changed(&store, "income", 1, &hash).await.unwrap());

    store.record_fingerprint("income", 1, hash.as_str(), Utc::now()).await.unwrap();
    assert!(!has_changed(&store, "income", 1, &hash).await.unwrap());
    assert!(has_changed(&store, "income", 1, &other).await.unwrap());

    // Fingerprints are scoped per table.
    assert!(has_changed(&store, "balance", 1, &hash).await.unwrap());
  }
}
