//! SQL schema for the tidemark SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS entities (
    entity_id      INTEGER PRIMARY KEY,
    identifier     TEXT NOT NULL,
    classification TEXT NOT NULL,
    exchange       TEXT,
    status         TEXT NOT NULL DEFAULT 'active',
    delisting_date TEXT              -- ISO 8601 date or NULL
);

-- One row per (table, entity). Written only through single-key upserts.
-- No foreign key: a failure may be recorded before the registry row lands.
CREATE TABLE IF NOT EXISTS watermarks (
    table_name           TEXT    NOT NULL,
    entity_id            INTEGER NOT NULL,
    last_observed_period TEXT,             -- ISO 8601 date; never decreases
    last_success_at      TEXT,             -- RFC 3339 UTC
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    updated_at           TEXT    NOT NULL,
    PRIMARY KEY (table_name, entity_id)
);

CREATE TABLE IF NOT EXISTS fingerprints (
    table_name   TEXT    NOT NULL,
    entity_id    INTEGER NOT NULL,
    content_hash TEXT    NOT NULL,
    recorded_at  TEXT    NOT NULL,
    PRIMARY KEY (table_name, entity_id)
);

-- Raw payloads, strictly append-only.
CREATE TABLE IF NOT EXISTS landing_records (
    landing_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       TEXT    NOT NULL,
    table_name   TEXT    NOT NULL,
    entity_id    INTEGER NOT NULL,
    identifier   TEXT    NOT NULL,
    outcome      TEXT    NOT NULL,   -- success | rate_limited | api_failure | empty
    content_hash TEXT    NOT NULL,
    payload_json TEXT    NOT NULL,
    fetched_at   TEXT    NOT NULL
);

-- Business records on their natural key.
CREATE TABLE IF NOT EXISTS records (
    table_name   TEXT    NOT NULL,
    entity_id    INTEGER NOT NULL,
    report_type  TEXT    NOT NULL,
    period       TEXT    NOT NULL,   -- ISO 8601 date
    payload_json TEXT    NOT NULL,
    created_at   TEXT    NOT NULL,
    updated_at   TEXT    NOT NULL,
    PRIMARY KEY (table_name, entity_id, report_type, period)
);

CREATE INDEX IF NOT EXISTS watermarks_entity_idx ON watermarks(entity_id);
CREATE INDEX IF NOT EXISTS landing_entity_idx    ON landing_records(table_name, entity_id);
CREATE INDEX IF NOT EXISTS landing_run_idx       ON landing_records(run_id);

PRAGMA user_version = 1;
";
