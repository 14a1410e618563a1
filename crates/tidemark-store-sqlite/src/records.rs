//! Business record persistence.
//!
//! A fetched payload holds one or more report sections. Each report in a
//! section becomes one `records` row keyed by
//! `(table_name, entity_id, report_type, period)`. Rewriting an unchanged
//! report is a no-op at the row level, so re-fetches that slip past the
//! fingerprint check still leave `updated_at` alone.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidemark_core::{
  entity::Entity,
  store::{Persisted, RecordSink},
};
use tracing::debug;

use crate::{
  encode::{decode_date, encode_date, encode_dt, DATE_FORMAT},
  Error, Result, SqliteStore,
};

// ─── Layout ──────────────────────────────────────────────────────────────────

/// How the reports under one payload key are arranged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum SectionShape {
  /// `"key": [{ "<period_field>": "2025-03-31", ... }, ...]`
  Array { period_field: String },
  /// `"key": { "2025-03-31": { ... }, ... }`
  DateKeyed,
}

/// One report section of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSection {
  /// Stored as `records.report_type`, e.g. `"quarterly"`.
  pub report_type: String,
  /// Top-level payload key holding the section.
  pub key:         String,
  #[serde(flatten)]
  pub shape:       SectionShape,
}

/// The sections making up one table's payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLayout {
  pub sections: Vec<ReportSection>,
}

impl ReportLayout {
  /// Split `payload` into `(report_type, period, report)` triples.
  ///
  /// Returns the usable reports and the number of reports skipped for a
  /// missing or unparseable period.
  pub fn extract<'p>(&'p self, payload: &'p Value) -> (Vec<ExtractedReport<'p>>, usize) {
    let mut reports = Vec::new();
    let mut skipped = 0;

    for section in &self.sections {
      let Some(body) = payload.get(&section.key) else {
        continue;
      };
      match (&section.shape, body) {
        (SectionShape::Array { period_field }, Value::Array(items)) => {
          for item in items {
            match item.get(period_field).and_then(Value::as_str).and_then(parse_period) {
              Some(period) => reports.push(ExtractedReport {
                report_type: &section.report_type,
                period,
                report: item,
              }),
              None => skipped += 1,
            }
          }
        }
        (SectionShape::DateKeyed, Value::Object(map)) => {
          for (key, item) in map {
            match parse_period(key) {
              Some(period) => reports.push(ExtractedReport {
                report_type: &section.report_type,
                period,
                report: item,
              }),
              None => skipped += 1,
            }
          }
        }
        _ => {
          debug!(key = %section.key, "report section has unexpected shape");
          skipped += 1;
        }
      }
    }

    (reports, skipped)
  }
}

/// A single report located inside a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedReport<'p> {
  pub report_type: &'p str,
  pub period:      NaiveDate,
  pub report:      &'p Value,
}

fn parse_period(s: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

// ─── Sink ────────────────────────────────────────────────────────────────────

/// [`RecordSink`] writing reports to the `records` table of a [`SqliteStore`].
#[derive(Clone)]
pub struct ReportSink {
  store:   SqliteStore,
  layouts: HashMap<String, ReportLayout>,
}

impl ReportSink {
  pub fn new(store: SqliteStore) -> Self { Self { store, layouts: HashMap::new() } }

  pub fn with_layout(mut self, table: impl Into<String>, layout: ReportLayout) -> Self {
    self.layouts.insert(table.into(), layout);
    self
  }

  /// Stored reports for one entity, ordered by report type and period.
  pub async fn records(&self, table: &str, entity_id: i64) -> Result<Vec<StoredRecord>> {
    let table = table.to_owned();

    let raws: Vec<(String, String, String)> = self
      .store
      .conn()
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT report_type, period, payload_json FROM records
           WHERE table_name = ?1 AND entity_id = ?2
           ORDER BY report_type, period",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![table, entity_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|(report_type, period, payload)| {
        Ok(StoredRecord {
          report_type,
          period: decode_date(&period)?,
          payload: serde_json::from_str(&payload)?,
        })
      })
      .collect()
  }
}

/// A row of the `records` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
  pub report_type: String,
  pub period:      NaiveDate,
  pub payload:     Value,
}

impl RecordSink for ReportSink {
  type Error = Error;

  async fn persist(&self, table: &str, entity: &Entity, payload: &Value) -> Result<Persisted> {
    let layout = self
      .layouts
      .get(table)
      .ok_or_else(|| Error::NoLayout(table.to_owned()))?;

    let (reports, skipped) = layout.extract(payload);
    if skipped > 0 {
      debug!(table, identifier = %entity.identifier, skipped, "skipped reports without a valid period");
    }

    let latest_period = reports.iter().map(|r| r.period).max();
    let rows: Vec<(String, String, String)> = reports
      .iter()
      .map(|r| Ok((r.report_type.to_owned(), encode_date(r.period), serde_json::to_string(r.report)?)))
      .collect::<Result<_>>()?;
    let records = rows.len();

    if rows.is_empty() {
      return Ok(Persisted { records: 0, changed: 0, skipped, latest_period: None });
    }

    let table = table.to_owned();
    let entity_id = entity.id;
    let now = encode_dt(Utc::now());

    let changed = self
      .store
      .conn()
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO records (
               table_name, entity_id, report_type, period, payload_json, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT (table_name, entity_id, report_type, period) DO UPDATE SET
               payload_json = excluded.payload_json,
               updated_at   = excluded.updated_at
             WHERE records.payload_json IS NOT excluded.payload_json",
          )?;
          for (report_type, period, payload) in &rows {
            changed += stmt.execute(rusqlite::params![
              table,
              entity_id,
              report_type,
              period,
              payload,
              now,
            ])?;
          }
        }
        tx.commit()?;
        Ok(changed)
      })
      .await?;

    Ok(Persisted { records, changed, skipped, latest_period })
  }
}
