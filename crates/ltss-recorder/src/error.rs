//! Error type for `ltss-recorder`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("failed to spawn the writer thread: {0}")]
  Spawn(#[source] std::io::Error),

  /// The writer thread has exited; nothing more will be written.
  #[error("the write pipeline is not accepting events")]
  Closed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
