//! Error types for `ltss-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid entity id: {0:?}")]
  InvalidEntityId(String),

  /// The attribute payload cannot be represented in the structured column.
  #[error("attribute payload cannot be encoded: {0}")]
  PayloadEncoding(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
