//! Incremental extraction for tidemark.
//!
//! Ties the pure selection logic from `tidemark-core` to an upstream fetch
//! service and a durable store: [`RateController`] paces calls,
//! [`Fetcher`] performs them, and [`Coordinator`] runs the per-entity loop
//! and keeps watermarks, fingerprints and business records in step.

#![allow(async_fn_in_trait)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod pacer;

pub use config::{ExtractConfig, TableConfig};
pub use coordinator::{Coordinator, RunSummary};
pub use error::{Error, Result};
pub use fetch::{FetchConfig, FetchResponse, Fetcher, HttpFetcher};
pub use pacer::{PacingConfig, RateController};
