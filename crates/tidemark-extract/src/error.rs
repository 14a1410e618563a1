//! Error type for `tidemark-extract`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// Any store failure. Aborts the run: continuing would risk losing
  /// watermark updates.
  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("http client error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("fingerprint error: {0}")]
  Fingerprint(#[from] tidemark_fingerprint::Error),

  #[error("no table named {0:?} in configuration")]
  UnknownTable(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
