//! The seam between the write pipeline and a storage backend.
//!
//! The pipeline owns a [`Connector`] and rebuilds its [`Session`] wholesale on
//! every bootstrap attempt. Sessions are used from a single thread only.

use thiserror::Error;

use crate::sample::{SchemaMode, StateSample};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Produces ready-to-use, schema-correct sessions.
pub trait Connector: Send + 'static {
  type Session: Session;
  type Error: std::error::Error + Send + Sync + 'static;

  /// Open a connection and converge the schema. Safe to repeat after a
  /// failure; every step re-probes the live store.
  fn connect(&mut self) -> Result<Self::Session, Self::Error>;
}

/// An open connection that accepts samples.
pub trait Session {
  /// Schema variant detected at bootstrap.
  fn mode(&self) -> SchemaMode;

  /// Persist one sample (and its attribute set) in a single transaction.
  fn write(&mut self, sample: &StateSample) -> Result<WriteOutcome, WriteError>;

  /// Release the connection.
  fn close(self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
  Inserted,
  /// A sample with the same `(time, entity_id)` already existed; nothing was
  /// changed.
  Duplicate,
}

/// Why a write did not commit.
#[derive(Debug, Error)]
pub enum WriteError {
  /// The server could not be reached or the connection dropped. Worth
  /// retrying.
  #[error("database connectivity error: {0}")]
  Transient(#[source] BoxError),

  /// Any other failure. Retrying the same sample will not help.
  #[error("database error: {0}")]
  Permanent(#[source] BoxError),
}

impl WriteError {
  pub fn is_transient(&self) -> bool { matches!(self, Self::Transient(_)) }
}
