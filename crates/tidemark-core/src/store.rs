//! Store traits consumed by the extraction coordinator.
//!
//! The traits are implemented by storage backends (e.g.
//! `tidemark-store-sqlite`). Higher layers depend on these abstractions, not
//! on any concrete backend. Every write is an upsert scoped to a single key,
//! so no cross-entity locking is needed.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  entity::Entity,
  outcome::FetchOutcome,
  select::CandidateRow,
  watermark::WatermarkRecord,
};

// ─── Watermarks ──────────────────────────────────────────────────────────────

/// Durable `(table, entity)` progress state.
pub trait WatermarkStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Fetch the watermark for a key. Returns `None` if never attempted.
  fn get<'a>(
    &'a self,
    table: &'a str,
    entity_id: i64,
  ) -> impl Future<Output = Result<Option<WatermarkRecord>, Self::Error>> + Send + 'a;

  /// Upsert a success at `at`.
  ///
  /// Sets `last_success_at = at`, `consecutive_failures = 0`, and
  /// `last_observed_period = max(existing, observed_period)`. A `None`
  /// observed period leaves the stored period unchanged.
  fn record_success<'a>(
    &'a self,
    table: &'a str,
    entity_id: i64,
    observed_period: Option<NaiveDate>,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Upsert a failure at `at`: increments `consecutive_failures` and touches
  /// `updated_at` only. A first failure creates the row with a count of 1.
  fn record_failure<'a>(
    &'a self,
    table: &'a str,
    entity_id: i64,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Operator override: clear the failure counter without recording a
  /// success. Returns `false` if no watermark exists for the key.
  fn reset_failures<'a>(
    &'a self,
    table: &'a str,
    entity_id: i64,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Every registry entity paired with its watermark for `table`, if any.
  fn candidate_rows<'a>(
    &'a self,
    table: &'a str,
  ) -> impl Future<Output = Result<Vec<CandidateRow>, Self::Error>> + Send + 'a;
}

// ─── Entity registry ─────────────────────────────────────────────────────────

/// Read access to the entity registry, plus the upsert used by imports.
pub trait EntityRegistry: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn list_entities(
    &self,
  ) -> impl Future<Output = Result<Vec<Entity>, Self::Error>> + Send + '_;

  fn get_entity(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<Entity>, Self::Error>> + Send + '_;

  fn upsert_entity<'a>(
    &'a self,
    entity: &'a Entity,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

// ─── Fingerprints ────────────────────────────────────────────────────────────

/// Last-known content fingerprint per `(table, entity)`.
pub trait FingerprintStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn last_fingerprint<'a>(
    &'a self,
    table: &'a str,
    entity_id: i64,
  ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + 'a;

  fn record_fingerprint<'a>(
    &'a self,
    table: &'a str,
    entity_id: i64,
    content_hash: &'a str,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

// ─── Landing records ─────────────────────────────────────────────────────────

/// The raw payload of one fetch attempt, kept for audit and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandingRecord {
  pub run_id:       Uuid,
  pub table_name:   String,
  pub entity_id:    i64,
  pub identifier:   String,
  pub outcome:      FetchOutcome,
  pub content_hash: String,
  pub payload:      serde_json::Value,
  pub fetched_at:   DateTime<Utc>,
}

/// Append-only store of raw fetch payloads.
pub trait LandingStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn record_landing<'a>(
    &'a self,
    record: &'a LandingRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

// ─── Business records ────────────────────────────────────────────────────────

/// Summary of one [`RecordSink::persist`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Persisted {
  /// Valid reports found in the payload and upserted.
  pub records:       usize,
  /// Upserted rows whose stored content actually changed.
  pub changed:       usize,
  /// Reports dropped for a missing or unparseable period.
  pub skipped:       usize,
  pub latest_period: Option<NaiveDate>,
}

impl Persisted {
  /// A payload that yielded no valid report at all is malformed.
  pub fn is_malformed(&self) -> bool { self.records == 0 }
}

/// Persists business records on their natural key.
///
/// Errors returned here are store failures and abort the run; payload
/// problems are reported through [`Persisted`] instead.
pub trait RecordSink: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn persist<'a>(
    &'a self,
    table: &'a str,
    entity: &'a Entity,
    payload: &'a serde_json::Value,
  ) -> impl Future<Output = Result<Persisted, Self::Error>> + Send + 'a;
}
