//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings, dates are `YYYY-MM-DD`, UUIDs are
//! hyphenated lowercase strings and payloads are compact JSON.

use chrono::{DateTime, NaiveDate, Utc};
use tidemark_core::{
  entity::{Entity, EntityStatus},
  outcome::FetchOutcome,
  select::CandidateRow,
  store::LandingRecord,
  watermark::WatermarkRecord,
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── NaiveDate ───────────────────────────────────────────────────────────────

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn encode_date(d: NaiveDate) -> String { d.format(DATE_FORMAT).to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── Counters ────────────────────────────────────────────────────────────────

pub fn decode_failures(n: i64) -> Result<u32> {
  u32::try_from(n).map_err(|_| Error::OutOfRange { column: "consecutive_failures", value: n })
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from an `entities` row.
pub struct RawEntity {
  pub entity_id:      i64,
  pub identifier:     String,
  pub classification: String,
  pub exchange:       Option<String>,
  pub status:         String,
  pub delisting_date: Option<String>,
}

impl RawEntity {
  /// Column list matching [`RawEntity::from_row`] at offset 0.
  pub const COLUMNS: &'static str =
    "e.entity_id, e.identifier, e.classification, e.exchange, e.status, e.delisting_date";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      entity_id:      row.get(0)?,
      identifier:     row.get(1)?,
      classification: row.get(2)?,
      exchange:       row.get(3)?,
      status:         row.get(4)?,
      delisting_date: row.get(5)?,
    })
  }

  pub fn into_entity(self) -> Result<Entity> {
    Ok(Entity {
      id:             self.entity_id,
      identifier:     self.identifier,
      classification: self.classification,
      exchange:       self.exchange,
      status:         EntityStatus::from(self.status.as_str()),
      delisting_date: self.delisting_date.as_deref().map(decode_date).transpose()?,
    })
  }
}

/// Raw values read directly from a `watermarks` row.
pub struct RawWatermark {
  pub table_name:           String,
  pub entity_id:            i64,
  pub last_observed_period: Option<String>,
  pub last_success_at:      Option<String>,
  pub consecutive_failures: i64,
  pub updated_at:           String,
}

impl RawWatermark {
  pub const COLUMNS: &'static str = "w.table_name, w.entity_id, w.last_observed_period, \
                                     w.last_success_at, w.consecutive_failures, w.updated_at";

  /// Read a watermark starting at column `offset`. Returns `None` when the
  /// row came from an unmatched LEFT JOIN.
  pub fn from_row_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Option<Self>> {
    let table_name: Option<String> = row.get(offset)?;
    let Some(table_name) = table_name else {
      return Ok(None);
    };
    Ok(Some(Self {
      table_name,
      entity_id: row.get(offset + 1)?,
      last_observed_period: row.get(offset + 2)?,
      last_success_at: row.get(offset + 3)?,
      consecutive_failures: row.get(offset + 4)?,
      updated_at: row.get(offset + 5)?,
    }))
  }

  pub fn into_watermark(self) -> Result<WatermarkRecord> {
    Ok(WatermarkRecord {
      table_name:           self.table_name,
      entity_id:            self.entity_id,
      last_observed_period: self.last_observed_period.as_deref().map(decode_date).transpose()?,
      last_success_at:      self.last_success_at.as_deref().map(decode_dt).transpose()?,
      consecutive_failures: decode_failures(self.consecutive_failures)?,
      updated_at:           decode_dt(&self.updated_at)?,
    })
  }
}

/// An entity row LEFT JOINed with its watermark.
pub struct RawCandidateRow {
  pub entity:    RawEntity,
  pub watermark: Option<RawWatermark>,
}

impl RawCandidateRow {
  pub fn into_candidate_row(self) -> Result<CandidateRow> {
    Ok(CandidateRow {
      entity:    self.entity.into_entity()?,
      watermark: self.watermark.map(RawWatermark::into_watermark).transpose()?,
    })
  }
}

/// Raw values read directly from a `landing_records` row.
pub struct RawLanding {
  pub run_id:       String,
  pub table_name:   String,
  pub entity_id:    i64,
  pub identifier:   String,
  pub outcome:      String,
  pub content_hash: String,
  pub payload_json: String,
  pub fetched_at:   String,
}

impl RawLanding {
  pub fn into_landing(self) -> Result<LandingRecord> {
    Ok(LandingRecord {
      run_id:       decode_uuid(&self.run_id)?,
      table_name:   self.table_name,
      entity_id:    self.entity_id,
      identifier:   self.identifier,
      outcome:      FetchOutcome::parse(&self.outcome)?,
      content_hash: self.content_hash,
      payload:      serde_json::from_str(&self.payload_json)?,
      fetched_at:   decode_dt(&self.fetched_at)?,
    })
  }
}
