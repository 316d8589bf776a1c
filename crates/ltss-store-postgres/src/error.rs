//! Error type for `ltss-store-postgres`.

use postgres::error::SqlState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] ltss_core::Error),

  #[error("database error: {0}")]
  Database(#[from] postgres::Error),

  /// A required extension is neither installed nor installable.
  #[error("required extension {0:?} is not available")]
  MissingExtension(&'static str),

  #[error("migration failed: {0}")]
  Migration(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  /// `true` if the failure means the server could not be reached or the
  /// connection dropped, as opposed to the server rejecting a statement.
  pub fn is_connectivity(&self) -> bool {
    match self {
      Error::Database(e) => is_connectivity(e),
      _ => false,
    }
  }
}

pub(crate) fn is_connectivity(err: &postgres::Error) -> bool {
  if err.is_closed() {
    return true;
  }
  match err.code() {
    Some(code) => {
      code.code().starts_with("08")
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
    }
    None => {
      std::error::Error::source(err).is_some_and(|s| s.downcast_ref::<std::io::Error>().is_some())
    }
  }
}
