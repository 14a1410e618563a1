//! SQLite backend for tidemark.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. [`SqliteStore`] implements every store
//! trait from `tidemark-core`; [`ReportSink`] persists business records on top
//! of it.

mod encode;
mod schema;
mod store;

pub mod error;
pub mod records;

pub use error::{Error, Result};
pub use records::{ReportLayout, ReportSection, ReportSink, SectionShape, StoredRecord};
pub use store::SqliteStore;
