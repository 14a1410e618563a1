//! [`SqliteStore`] — the SQLite implementation of the tidemark store traits.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::OptionalExtension as _;
use tidemark_core::{
  entity::Entity,
  select::CandidateRow,
  store::{EntityRegistry, FingerprintStore, LandingRecord, LandingStore, WatermarkStore},
  watermark::WatermarkRecord,
};

use crate::{
  encode::{
    encode_date, encode_dt, encode_uuid, RawCandidateRow, RawEntity, RawLanding, RawWatermark,
  },
  schema::SCHEMA,
  Result,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A tidemark store backed by a single SQLite file.
///
/// Cloning is cheap — the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub(crate) fn conn(&self) -> &tokio_rusqlite::Connection { &self.conn }

  /// Landing records for one entity, oldest first.
  pub async fn landing_records(&self, table: &str, entity_id: i64) -> Result<Vec<LandingRecord>> {
    let table = table.to_owned();

    let raws: Vec<RawLanding> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT run_id, table_name, entity_id, identifier, outcome,
                  content_hash, payload_json, fetched_at
           FROM landing_records
           WHERE table_name = ?1 AND entity_id = ?2
           ORDER BY landing_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![table, entity_id], |row| {
            Ok(RawLanding {
              run_id:       row.get(0)?,
              table_name:   row.get(1)?,
              entity_id:    row.get(2)?,
              identifier:   row.get(3)?,
              outcome:      row.get(4)?,
              content_hash: row.get(5)?,
              payload_json: row.get(6)?,
              fetched_at:   row.get(7)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawLanding::into_landing).collect()
  }
}

// ─── WatermarkStore impl ─────────────────────────────────────────────────────

impl WatermarkStore for SqliteStore {
  type Error = crate::Error;

  async fn get(&self, table: &str, entity_id: i64) -> Result<Option<WatermarkRecord>> {
    let table = table.to_owned();

    let raw: Option<RawWatermark> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {} FROM watermarks w WHERE w.table_name = ?1 AND w.entity_id = ?2",
          RawWatermark::COLUMNS
        );
        Ok(
          conn
            .query_row(&sql, rusqlite::params![table, entity_id], |row| {
              RawWatermark::from_row_at(row, 0)
            })
            .optional()?
            .flatten(),
        )
      })
      .await?;

    raw.map(RawWatermark::into_watermark).transpose()
  }

  async fn record_success(
    &self,
    table: &str,
    entity_id: i64,
    observed_period: Option<NaiveDate>,
    at: DateTime<Utc>,
  ) -> Result<()> {
    let table = table.to_owned();
    let period = observed_period.map(encode_date);
    let at = encode_dt(at);

    self
      .conn
      .call(move |conn| {
        // SQLite's scalar MAX() yields NULL if either side is NULL.
        conn.execute(
          "INSERT INTO watermarks (
             table_name, entity_id, last_observed_period,
             last_success_at, consecutive_failures, updated_at
           ) VALUES (?1, ?2, ?3, ?4, 0, ?4)
           ON CONFLICT (table_name, entity_id) DO UPDATE SET
             last_observed_period = CASE
               WHEN excluded.last_observed_period IS NULL THEN watermarks.last_observed_period
               WHEN watermarks.last_observed_period IS NULL THEN excluded.last_observed_period
               ELSE MAX(watermarks.last_observed_period, excluded.last_observed_period)
             END,
             last_success_at      = excluded.last_success_at,
             consecutive_failures = 0,
             updated_at           = excluded.updated_at",
          rusqlite::params![table, entity_id, period, at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn record_failure(&self, table: &str, entity_id: i64, at: DateTime<Utc>) -> Result<()> {
    let table = table.to_owned();
    let at = encode_dt(at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO watermarks (table_name, entity_id, consecutive_failures, updated_at)
           VALUES (?1, ?2, 1, ?3)
           ON CONFLICT (table_name, entity_id) DO UPDATE SET
             consecutive_failures = watermarks.consecutive_failures + 1,
             updated_at           = excluded.updated_at",
          rusqlite::params![table, entity_id, at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn reset_failures(&self, table: &str, entity_id: i64, at: DateTime<Utc>) -> Result<bool> {
    let table = table.to_owned();
    let at = encode_dt(at);

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE watermarks SET consecutive_failures = 0, updated_at = ?3
           WHERE table_name = ?1 AND entity_id = ?2",
          rusqlite::params![table, entity_id, at],
        )?)
      })
      .await?;
    Ok(changed > 0)
  }

  async fn candidate_rows(&self, table: &str) -> Result<Vec<CandidateRow>> {
    let table = table.to_owned();

    let raws: Vec<RawCandidateRow> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {}, {}
           FROM entities e
           LEFT JOIN watermarks w
             ON w.entity_id = e.entity_id AND w.table_name = ?1
           ORDER BY e.entity_id",
          RawEntity::COLUMNS,
          RawWatermark::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params![table], |row| {
            Ok(RawCandidateRow {
              entity:    RawEntity::from_row(row)?,
              watermark: RawWatermark::from_row_at(row, 6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawCandidateRow::into_candidate_row).collect()
  }
}

// ─── EntityRegistry impl ─────────────────────────────────────────────────────

impl EntityRegistry for SqliteStore {
  type Error = crate::Error;

  async fn list_entities(&self) -> Result<Vec<Entity>> {
    let raws: Vec<RawEntity> = self
      .conn
      .call(|conn| {
        let sql = format!("SELECT {} FROM entities e ORDER BY e.entity_id", RawEntity::COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map([], RawEntity::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawEntity::into_entity).collect()
  }

  async fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
    let raw: Option<RawEntity> = self
      .conn
      .call(move |conn| {
        let sql = format!("SELECT {} FROM entities e WHERE e.entity_id = ?1", RawEntity::COLUMNS);
        Ok(
          conn
            .query_row(&sql, rusqlite::params![id], RawEntity::from_row)
            .optional()?,
        )
      })
      .await?;

    raw.map(RawEntity::into_entity).transpose()
  }

  async fn upsert_entity(&self, entity: &Entity) -> Result<()> {
    let id             = entity.id;
    let identifier     = entity.identifier.clone();
    let classification = entity.classification.clone();
    let exchange       = entity.exchange.clone();
    let status         = entity.status.as_str().to_owned();
    let delisting_date = entity.delisting_date.map(encode_date);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO entities (
             entity_id, identifier, classification, exchange, status, delisting_date
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT (entity_id) DO UPDATE SET
             identifier     = excluded.identifier,
             classification = excluded.classification,
             exchange       = excluded.exchange,
             status         = excluded.status,
             delisting_date = excluded.delisting_date",
          rusqlite::params![id, identifier, classification, exchange, status, delisting_date],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── FingerprintStore impl ───────────────────────────────────────────────────

impl FingerprintStore for SqliteStore {
  type Error = crate::Error;

  async fn last_fingerprint(&self, table: &str, entity_id: i64) -> Result<Option<String>> {
    let table = table.to_owned();

    let hash = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT content_hash FROM fingerprints WHERE table_name = ?1 AND entity_id = ?2",
              rusqlite::params![table, entity_id],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    Ok(hash)
  }

  async fn record_fingerprint(
    &self,
    table: &str,
    entity_id: i64,
    content_hash: &str,
    at: DateTime<Utc>,
  ) -> Result<()> {
    let table = table.to_owned();
    let hash = content_hash.to_owned();
    let at = encode_dt(at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO fingerprints (table_name, entity_id, content_hash, recorded_at)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (table_name, entity_id) DO UPDATE SET
             content_hash = excluded.content_hash,
             recorded_at  = excluded.recorded_at",
          rusqlite::params![table, entity_id, hash, at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── LandingStore impl ───────────────────────────────────────────────────────

impl LandingStore for SqliteStore {
  type Error = crate::Error;

  async fn record_landing(&self, record: &LandingRecord) -> Result<()> {
    let run_id       = encode_uuid(record.run_id);
    let table        = record.table_name.clone();
    let entity_id    = record.entity_id;
    let identifier   = record.identifier.clone();
    let outcome      = record.outcome.as_ref().to_owned();
    let content_hash = record.content_hash.clone();
    let payload      = serde_json::to_string(&record.payload)?;
    let fetched_at   = encode_dt(record.fetched_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO landing_records (
             run_id, table_name, entity_id, identifier, outcome,
             content_hash, payload_json, fetched_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          rusqlite::params![
            run_id,
            table,
            entity_id,
            identifier,
            outcome,
            content_hash,
            payload,
            fetched_at,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
