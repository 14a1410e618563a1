//! `tidemark` — incremental extraction driver.
//!
//! # Usage
//!
//! ```
//! tidemark --config tidemark.toml import entities.json
//! tidemark select --table balance_sheet
//! tidemark run --table balance_sheet --limit 500
//! tidemark reset --table balance_sheet --entity 42
//! ```

use std::{path::PathBuf, sync::atomic::Ordering};

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tidemark_core::{
  entity::Entity,
  screen::PreScreenFilter,
  select::EligibilitySelector,
  store::{EntityRegistry, WatermarkStore},
};
use tidemark_extract::{Coordinator, ExtractConfig, HttpFetcher, RateController};
use tidemark_store_sqlite::{ReportSink, SqliteStore};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(author, version, about = "Incremental extraction with watermarks")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "tidemark.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Fetch and persist every eligible entity for a table.
  Run {
    #[arg(long)]
    table:            String,
    /// Process at most this many candidates.
    #[arg(long)]
    limit:            Option<usize>,
    #[arg(long)]
    no_pre_screen:    bool,
    #[arg(long)]
    no_gap_detection: bool,
  },
  /// Print what `run` would process, without calling upstream.
  Select {
    #[arg(long)]
    table: String,
    #[arg(long)]
    limit: Option<usize>,
  },
  /// Clear an entity's failure counter so it becomes selectable again.
  Reset {
    #[arg(long)]
    table:  String,
    #[arg(long)]
    entity: i64,
  },
  /// Upsert registry entities from a JSON array.
  Import { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(
      config::Environment::with_prefix("TIDEMARK")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true),
    )
    .build()
    .context("failed to read config file")?;

  let cfg: ExtractConfig = settings
    .try_deserialize()
    .context("failed to deserialise ExtractConfig")?;

  let store_path = cfg.store_path();
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  match cli.command {
    Command::Run { table, limit, no_pre_screen, no_gap_detection } => {
      let table_cfg = cfg.table(&table)?;
      let mut params = table_cfg.selection_params();
      params.limit = limit.or(params.limit);
      params.pre_screen_enabled &= !no_pre_screen;
      params.gap_detection_enabled &= !no_gap_detection;

      let sink = ReportSink::new(store.clone()).with_layout(&table, table_cfg.layout.clone());
      let fetcher = HttpFetcher::new(cfg.fetch.clone(), &table_cfg.function)
        .context("failed to build HTTP client")?;
      let coordinator = Coordinator::new(store, sink, fetcher)
        .with_selector(EligibilitySelector::new(PreScreenFilter::new(cfg.screen.clone())))
        .with_fingerprinter(cfg.fingerprint.fingerprinter());

      let shutdown = coordinator.shutdown_handle();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          tracing::warn!("interrupt received, finishing current entity");
          shutdown.store(true, Ordering::SeqCst);
        }
      });

      let mut pacer = RateController::new(cfg.pacing.clone());
      let summary = coordinator
        .run(&params, &mut pacer)
        .await
        .with_context(|| format!("extraction of {table} aborted"))?;

      println!(
        "{}: selected {}, processed {}, success {}, no_changes {}, failed {}, rate_limited {}, empty {}, records {}{}",
        summary.table_name,
        summary.selected,
        summary.processed,
        summary.successful,
        summary.no_changes,
        summary.failed,
        summary.rate_limited,
        summary.empty,
        summary.records_written,
        if summary.interrupted { " (interrupted)" } else { "" },
      );
    }

    Command::Select { table, limit } => {
      let mut params = cfg.table(&table)?.selection_params();
      params.limit = limit.or(params.limit);

      let rows = store.candidate_rows(&table).await?;
      let selector = EligibilitySelector::new(PreScreenFilter::new(cfg.screen.clone()));
      let selection = selector.select(rows, &params, Utc::now());

      for c in &selection.candidates {
        let last_success = c
          .watermark
          .as_ref()
          .and_then(|w| w.last_success_at)
          .map_or_else(|| "never".to_owned(), |at| at.to_rfc3339());
        println!("{:?}\t{}\t{}\t{}", c.priority, c.entity.id, c.entity.identifier, last_success);
      }
      println!("{}", serde_json::to_string_pretty(&selection.stats)?);
    }

    Command::Reset { table, entity } => {
      if store.reset_failures(&table, entity, Utc::now()).await? {
        println!("reset failures for entity {entity} in {table}");
      } else {
        anyhow::bail!("no watermark for entity {entity} in {table}");
      }
    }

    Command::Import { path } => {
      let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {path:?}"))?;
      let entities: Vec<Entity> =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {path:?}"))?;
      for e in &entities {
        store.upsert_entity(e).await?;
      }
      tracing::info!(count = entities.len(), "imported entities");
    }
  }

  Ok(())
}
