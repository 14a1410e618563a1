//! The extraction loop.
//!
//! One run selects candidates for a table and processes them strictly in
//! order, one upstream call at a time:
//!
//! ```text
//! pre_call → fetch → post_call → landing record → fingerprint
//!   → persist → watermark → fingerprint record
//! ```
//!
//! Per-entity failures are recorded on the watermark and the loop moves on.
//! Store errors abort the run. Each entity's writes commit before the next
//! entity starts, so an interrupted run leaves consistent state behind.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tidemark_core::{
  entity::Entity,
  outcome::{AttemptOutcome, ExtractionAttempt, FetchOutcome},
  select::{EligibilitySelector, Selection, SelectionParams},
  store::{FingerprintStore, LandingRecord, LandingStore, RecordSink, WatermarkStore},
};
use tidemark_fingerprint::{has_changed, ContentFingerprinter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  fetch::Fetcher,
  pacer::RateController,
  Error, Result,
};

fn store_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> Error {
  Error::Store(Box::new(e))
}

// ─── Summary ─────────────────────────────────────────────────────────────────

/// Totals for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
  pub run_id:          Uuid,
  pub table_name:      String,
  pub selected:        usize,
  pub processed:       usize,
  pub successful:      usize,
  pub no_changes:      usize,
  pub failed:          usize,
  pub rate_limited:    usize,
  pub empty:           usize,
  pub records_written: usize,
  /// The shutdown flag stopped the run before every candidate was processed.
  pub interrupted:     bool,
  pub attempts:        Vec<ExtractionAttempt>,
}

impl RunSummary {
  fn record(&mut self, attempt: ExtractionAttempt) {
    self.processed += 1;
    self.records_written += attempt.records_written;
    match attempt.outcome {
      AttemptOutcome::Success => self.successful += 1,
      AttemptOutcome::NoChanges => self.no_changes += 1,
      AttemptOutcome::ApiFailure => self.failed += 1,
      AttemptOutcome::RateLimited => self.rate_limited += 1,
      AttemptOutcome::Empty => self.empty += 1,
    }
    self.attempts.push(attempt);
  }
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

/// Drives selection, fetching and persistence for one table at a time.
pub struct Coordinator<S, K, F> {
  store:         S,
  sink:          K,
  fetcher:       F,
  selector:      EligibilitySelector,
  fingerprinter: ContentFingerprinter,
  shutdown:      Arc<AtomicBool>,
}

impl<S, K, F> Coordinator<S, K, F>
where
  S: WatermarkStore + FingerprintStore + LandingStore,
  K: RecordSink,
  F: Fetcher,
{
  pub fn new(store: S, sink: K, fetcher: F) -> Self {
    Self {
      store,
      sink,
      fetcher,
      selector: EligibilitySelector::default(),
      fingerprinter: ContentFingerprinter::default(),
      shutdown: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn with_selector(mut self, selector: EligibilitySelector) -> Self {
    self.selector = selector;
    self
  }

  pub fn with_fingerprinter(mut self, fingerprinter: ContentFingerprinter) -> Self {
    self.fingerprinter = fingerprinter;
    self
  }

  /// Setting the returned flag stops the run before the next entity.
  pub fn shutdown_handle(&self) -> Arc<AtomicBool> { Arc::clone(&self.shutdown) }

  /// Ordered candidates for `params.table_name` as of now.
  pub async fn select(&self, params: &SelectionParams) -> Result<Selection> {
    let rows = self
      .store
      .candidate_rows(&params.table_name)
      .await
      .map_err(store_err)?;
    Ok(self.selector.select(rows, params, Utc::now()))
  }

  pub async fn on_success(
    &self,
    table: &str,
    entity_id: i64,
    observed_period: Option<NaiveDate>,
  ) -> Result<()> {
    self
      .store
      .record_success(table, entity_id, observed_period, Utc::now())
      .await
      .map_err(store_err)
  }

  pub async fn on_failure(&self, table: &str, entity_id: i64) -> Result<()> {
    self
      .store
      .record_failure(table, entity_id, Utc::now())
      .await
      .map_err(store_err)
  }

  /// Select and process every candidate for `params.table_name`.
  pub async fn run(
    &self,
    params: &SelectionParams,
    pacer: &mut RateController,
  ) -> Result<RunSummary> {
    let table = params.table_name.as_str();
    let run_id = Uuid::new_v4();
    let selection = self.select(params).await?;
    let stats = &selection.stats;

    info!(
      %run_id,
      table,
      universe = stats.universe,
      selected = stats.selected,
      screened = stats.screened,
      blacklisted = stats.blacklisted,
      cooling_off = stats.cooling_off,
      up_to_date = stats.up_to_date,
      truncated = stats.truncated,
      expected_period_end = ?selection.expected_period_end,
      "selection complete"
    );

    let mut summary = RunSummary {
      run_id,
      table_name: table.to_owned(),
      selected: selection.candidates.len(),
      ..RunSummary::default()
    };

    let total = selection.candidates.len();
    let report_every = pacer.report_every();

    for (i, candidate) in selection.candidates.iter().enumerate() {
      if self.shutdown.load(Ordering::SeqCst) {
        warn!(%run_id, table, remaining = total - i, "shutdown requested, stopping run");
        summary.interrupted = true;
        break;
      }

      let attempt = self.process(run_id, table, &candidate.entity, pacer).await?;
      summary.record(attempt);

      let done = (i + 1) as u64;
      if report_every > 0 && done % report_every == 0 {
        let p = pacer.stats(total - i - 1);
        info!(
          table,
          done,
          total,
          calls = p.calls,
          rate_limit_hits = p.rate_limit_hits,
          state = %p.state,
          interval = ?p.current_interval,
          mean_interval = ?p.mean_interval,
          eta = ?p.eta,
          "progress"
        );
      }
    }

    info!(
      %run_id,
      table,
      processed = summary.processed,
      successful = summary.successful,
      no_changes = summary.no_changes,
      failed = summary.failed,
      rate_limited = summary.rate_limited,
      empty = summary.empty,
      records_written = summary.records_written,
      interrupted = summary.interrupted,
      "run complete"
    );

    Ok(summary)
  }

  /// One attempt for one entity, with all of its writes.
  async fn process(
    &self,
    run_id: Uuid,
    table: &str,
    entity: &Entity,
    pacer: &mut RateController,
  ) -> Result<ExtractionAttempt> {
    pacer.pre_call().await;
    let response = self.fetcher.fetch(&entity.identifier).await;
    pacer.post_call(response.outcome);

    let fetched_at = Utc::now();
    let hash = self.fingerprinter.fingerprint_value(&response.payload);

    self
      .store
      .record_landing(&LandingRecord {
        run_id,
        table_name: table.to_owned(),
        entity_id: entity.id,
        identifier: entity.identifier.clone(),
        outcome: response.outcome,
        content_hash: hash.to_string(),
        payload: response.payload.clone(),
        fetched_at,
      })
      .await
      .map_err(store_err)?;

    let mut attempt = ExtractionAttempt {
      run_id,
      entity_id: entity.id,
      identifier: entity.identifier.clone(),
      content_hash: hash.to_string(),
      outcome: AttemptOutcome::from(response.outcome),
      records_written: 0,
      observed_period: None,
      error: response.message.clone(),
    };

    if response.outcome != FetchOutcome::Success {
      self.on_failure(table, entity.id).await?;
      warn!(
        table,
        identifier = %entity.identifier,
        outcome = %attempt.outcome,
        error = attempt.error.as_deref().unwrap_or_default(),
        "fetch failed"
      );
      return Ok(attempt);
    }

    let changed = has_changed(&self.store, table, entity.id, &hash)
      .await
      .map_err(store_err)?;
    if !changed {
      self.on_success(table, entity.id, None).await?;
      attempt.outcome = AttemptOutcome::NoChanges;
      debug!(table, identifier = %entity.identifier, "content unchanged");
      return Ok(attempt);
    }

    let persisted = self
      .sink
      .persist(table, entity, &response.payload)
      .await
      .map_err(store_err)?;

    if persisted.is_malformed() {
      self.on_failure(table, entity.id).await?;
      attempt.outcome = AttemptOutcome::ApiFailure;
      attempt.error = Some(format!(
        "malformed payload: no report with a valid period ({} skipped)",
        persisted.skipped
      ));
      warn!(
        table,
        identifier = %entity.identifier,
        skipped = persisted.skipped,
        "malformed payload"
      );
      return Ok(attempt);
    }

    self
      .on_success(table, entity.id, persisted.latest_period)
      .await?;
    self
      .store
      .record_fingerprint(table, entity.id, hash.as_str(), Utc::now())
      .await
      .map_err(store_err)?;

    attempt.records_written = persisted.records;
    attempt.observed_period = persisted.latest_period;
    debug!(
      table,
      identifier = %entity.identifier,
      records = persisted.records,
      changed = persisted.changed,
      latest_period = ?persisted.latest_period,
      "persisted"
    );
    Ok(attempt)
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
  };

  use chrono::{DateTime, TimeDelta};
  use serde_json::{json, Value};
  use tidemark_core::{
    select::CandidateRow,
    store::{EntityRegistry, WatermarkStore},
    watermark::WatermarkRecord,
  };
  use tidemark_store_sqlite::{
    Error as StoreError, ReportLayout, ReportSection, ReportSink, SectionShape, SqliteStore,
  };

  use super::*;
  use crate::{fetch::FetchResponse, pacer::PacingConfig};

  const TABLE: &str = "balance_sheet";

  /// Replays queued responses per identifier; an exhausted queue yields
  /// `api_failure`.
  #[derive(Default)]
  struct ScriptedFetcher {
    queued: Mutex<HashMap<String, VecDeque<FetchResponse>>>,
    calls:  Mutex<Vec<String>>,
  }

  impl ScriptedFetcher {
    fn push(&self, identifier: &str, response: FetchResponse) {
      self
        .queued
        .lock()
        .unwrap()
        .entry(identifier.to_owned())
        .or_default()
        .push_back(response);
    }

    fn calls(&self) -> Vec<String> { self.calls.lock().unwrap().clone() }
  }

  impl Fetcher for &ScriptedFetcher {
    async fn fetch(&self, identifier: &str) -> FetchResponse {
      self.calls.lock().unwrap().push(identifier.to_owned());
      let next = self
        .queued
        .lock()
        .unwrap()
        .get_mut(identifier)
        .and_then(VecDeque::pop_front);
      next.unwrap_or_else(|| FetchResponse::failed(FetchOutcome::ApiFailure, "script exhausted"))
    }
  }

  fn layout() -> ReportLayout {
    ReportLayout {
      sections: vec![ReportSection {
        report_type: "quarterly".into(),
        key:         "quarterlyReports".into(),
        shape:       SectionShape::Array { period_field: "fiscalDateEnding".into() },
      }],
    }
  }

  fn report(periods: &[&str]) -> Value {
    let reports: Vec<Value> = periods
      .iter()
      .map(|p| json!({ "fiscalDateEnding": p, "totalAssets": "100" }))
      .collect();
    json!({ "symbol": "IBM", "quarterlyReports": reports })
  }

  fn pacer() -> RateController {
    RateController::new(PacingConfig {
      calls_per_minute: 60_000,
      cooldown_ms: 0,
      ..PacingConfig::default()
    })
  }

  async fn setup<'f>(
    entities: &[Entity],
    fetcher: &'f ScriptedFetcher,
  ) -> (SqliteStore, Coordinator<SqliteStore, ReportSink, &'f ScriptedFetcher>) {
    let store = SqliteStore::open_in_memory().await.unwrap();
    for e in entities {
      store.upsert_entity(e).await.unwrap();
    }
    let sink = ReportSink::new(store.clone()).with_layout(TABLE, layout());
    let coordinator = Coordinator::new(store.clone(), sink, fetcher);
    (store, coordinator)
  }

  #[tokio::test]
  async fn never_processed_entity_is_blacklisted_after_three_failed_runs() {
    let fetcher = ScriptedFetcher::default();
    let (store, c) = setup(&[Entity::active(1, "IBM", "Stock")], &fetcher).await;
    let params = SelectionParams::new(TABLE);
    let mut pacer = pacer();

    for run in 1..=3 {
      let summary = c.run(&params, &mut pacer).await.unwrap();
      assert_eq!(summary.selected, 1, "run {run}");
      assert_eq!(summary.failed, 1, "run {run}");
    }
    assert_eq!(store.get(TABLE, 1).await.unwrap().unwrap().consecutive_failures, 3);

    let fourth = c.run(&params, &mut pacer).await.unwrap();
    assert_eq!(fourth.selected, 0);
    assert_eq!(fetcher.calls().len(), 3);
  }

  #[tokio::test]
  async fn success_persists_and_advances_watermark() {
    let fetcher = ScriptedFetcher::default();
    fetcher.push("IBM", FetchResponse::success(report(&["2024-12-31", "2025-03-31"])));
    let (store, c) = setup(&[Entity::active(1, "IBM", "Stock")], &fetcher).await;

    let summary = c.run(&SelectionParams::new(TABLE), &mut pacer()).await.unwrap();
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.records_written, 2);

    let attempt = &summary.attempts[0];
    assert_eq!(attempt.outcome, AttemptOutcome::Success);
    assert_eq!(attempt.observed_period, NaiveDate::from_ymd_opt(2025, 3, 31));

    let w = store.get(TABLE, 1).await.unwrap().unwrap();
    assert_eq!(w.last_observed_period, NaiveDate::from_ymd_opt(2025, 3, 31));
    assert_eq!(w.consecutive_failures, 0);
    assert_eq!(
      store.last_fingerprint(TABLE, 1).await.unwrap().as_deref(),
      Some(attempt.content_hash.as_str())
    );
    assert_eq!(store.landing_records(TABLE, 1).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn unchanged_content_is_no_changes_but_still_a_success() {
    let fetcher = ScriptedFetcher::default();
    let mut first = report(&["2025-03-31"]);
    first["fetched_at"] = json!("2025-05-01T00:00:00Z");
    let mut second = report(&["2025-03-31"]);
    second["fetched_at"] = json!("2025-05-09T00:00:00Z");
    fetcher.push("IBM", FetchResponse::success(first));
    fetcher.push("IBM", FetchResponse::success(second));

    let (store, c) = setup(&[Entity::active(1, "IBM", "Stock")], &fetcher).await;
    let mut params = SelectionParams::new(TABLE);
    params.staleness_threshold = TimeDelta::zero();
    let mut pacer = pacer();

    c.run(&params, &mut pacer).await.unwrap();
    let before = store.get(TABLE, 1).await.unwrap().unwrap();

    store.record_failure(TABLE, 1, Utc::now()).await.unwrap();
    let summary = c.run(&params, &mut pacer).await.unwrap();
    assert_eq!(summary.no_changes, 1);
    assert_eq!(summary.records_written, 0);

    let after = store.get(TABLE, 1).await.unwrap().unwrap();
    assert_eq!(after.consecutive_failures, 0);
    assert!(after.last_success_at > before.last_success_at);
    assert_eq!(after.last_observed_period, before.last_observed_period);
  }

  #[tokio::test]
  async fn malformed_payload_counts_as_failure_without_aborting() {
    let fetcher = ScriptedFetcher::default();
    fetcher.push("AAA", FetchResponse::success(report(&["not a date"])));
    fetcher.push("BBB", FetchResponse::success(report(&["2025-03-31"])));
    let (store, c) = setup(
      &[Entity::active(1, "AAA", "Stock"), Entity::active(2, "BBB", "Stock")],
      &fetcher,
    )
    .await;

    let summary = c.run(&SelectionParams::new(TABLE), &mut pacer()).await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.successful, 1);

    let bad = &summary.attempts[0];
    assert_eq!(bad.identifier, "AAA");
    assert_eq!(bad.outcome, AttemptOutcome::ApiFailure);
    assert!(bad.error.as_deref().unwrap().starts_with("malformed payload"));

    assert_eq!(store.get(TABLE, 1).await.unwrap().unwrap().consecutive_failures, 1);
    assert!(store.last_fingerprint(TABLE, 1).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn rate_limited_and_empty_are_failures() {
    let fetcher = ScriptedFetcher::default();
    fetcher.push("AAA", FetchResponse::failed(FetchOutcome::RateLimited, "Note"));
    fetcher.push("BBB", FetchResponse {
      payload: json!({}),
      outcome: FetchOutcome::Empty,
      message: None,
    });
    let (store, c) = setup(
      &[Entity::active(1, "AAA", "Stock"), Entity::active(2, "BBB", "Stock")],
      &fetcher,
    )
    .await;
    let mut pacer = pacer();

    let summary = c.run(&SelectionParams::new(TABLE), &mut pacer).await.unwrap();
    assert_eq!(summary.rate_limited, 1);
    assert_eq!(summary.empty, 1);
    assert_eq!(pacer.stats(0).rate_limit_hits, 1);

    for id in [1, 2] {
      assert_eq!(store.get(TABLE, id).await.unwrap().unwrap().consecutive_failures, 1);
    }
    let landed = store.landing_records(TABLE, 1).await.unwrap();
    assert_eq!(landed[0].outcome, FetchOutcome::RateLimited);
  }

  #[tokio::test]
  async fn candidates_are_processed_in_selection_order() {
    let fetcher = ScriptedFetcher::default();
    let (store, c) = setup(
      &[
        Entity::active(1, "MSFT", "Stock"),
        Entity::active(2, "FB", "Stock"),
        Entity::active(3, "TSLAW", "Stock"),
        Entity::active(4, "AMD", "Stock"),
      ],
      &fetcher,
    )
    .await;
    store
      .record_success(TABLE, 1, NaiveDate::from_ymd_opt(2000, 3, 31), Utc::now() - TimeDelta::days(30))
      .await
      .unwrap();

    let mut params = SelectionParams::new(TABLE);
    params.limit = Some(2);
    c.run(&params, &mut pacer()).await.unwrap();
    assert_eq!(fetcher.calls(), vec!["FB", "AMD"]);
  }

  #[tokio::test]
  async fn shutdown_stops_before_next_entity() {
    let fetcher = ScriptedFetcher::default();
    let (store, c) = setup(&[Entity::active(1, "IBM", "Stock")], &fetcher).await;
    c.shutdown_handle().store(true, Ordering::SeqCst);

    let summary = c.run(&SelectionParams::new(TABLE), &mut pacer()).await.unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.selected, 1);
    assert_eq!(summary.processed, 0);
    assert!(fetcher.calls().is_empty());
    assert!(store.get(TABLE, 1).await.unwrap().is_none());
  }

  /// Delegates to SQLite but refuses every landing write.
  struct BrokenLanding(SqliteStore);

  impl WatermarkStore for BrokenLanding {
    type Error = StoreError;

    async fn get(&self, table: &str, entity_id: i64) -> Result<Option<WatermarkRecord>, StoreError> {
      self.0.get(table, entity_id).await
    }

    async fn record_success(
      &self,
      table: &str,
      entity_id: i64,
      observed_period: Option<NaiveDate>,
      at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
      self.0.record_success(table, entity_id, observed_period, at).await
    }

    async fn record_failure(&self, table: &str, entity_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
      self.0.record_failure(table, entity_id, at).await
    }

    async fn reset_failures(&self, table: &str, entity_id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
      self.0.reset_failures(table, entity_id, at).await
    }

    async fn candidate_rows(&self, table: &str) -> Result<Vec<CandidateRow>, StoreError> {
      self.0.candidate_rows(table).await
    }
  }

  impl FingerprintStore for BrokenLanding {
    type Error = StoreError;

    async fn last_fingerprint(&self, table: &str, entity_id: i64) -> Result<Option<String>, StoreError> {
      self.0.last_fingerprint(table, entity_id).await
    }

    async fn record_fingerprint(
      &self,
      table: &str,
      entity_id: i64,
      content_hash: &str,
      at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
      self.0.record_fingerprint(table, entity_id, content_hash, at).await
    }
  }

  impl LandingStore for BrokenLanding {
    type Error = std::io::Error;

    async fn record_landing(&self, _record: &LandingRecord) -> Result<(), std::io::Error> {
      Err(std::io::Error::other("disk full"))
    }
  }

  #[tokio::test]
  async fn store_error_aborts_the_run() {
    let fetcher = ScriptedFetcher::default();
    fetcher.push("AAA", FetchResponse::success(report(&["2025-03-31"])));
    fetcher.push("BBB", FetchResponse::success(report(&["2025-03-31"])));
    let (store, _) = setup(
      &[Entity::active(1, "AAA", "Stock"), Entity::active(2, "BBB", "Stock")],
      &fetcher,
    )
    .await;
    let sink = ReportSink::new(store.clone()).with_layout(TABLE, layout());
    let c = Coordinator::new(BrokenLanding(store.clone()), sink, &fetcher);

    let err = c.run(&SelectionParams::new(TABLE), &mut pacer()).await.unwrap_err();
    assert!(matches!(err, Error::Store(_)), "{err}");
    assert!(err.to_string().contains("disk full"));

    assert_eq!(fetcher.calls(), vec!["AAA"]);
    for id in [1, 2] {
      assert!(store.get(TABLE, id).await.unwrap().is_none());
    }
  }
}
