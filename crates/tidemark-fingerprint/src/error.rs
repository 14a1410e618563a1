//! Error type for `tidemark-fingerprint`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// The record could not be converted to a JSON value before encoding.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
