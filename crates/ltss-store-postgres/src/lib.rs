//! PostgreSQL backend for the long-term state store.
//!
//! Uses the synchronous [`postgres`] client: the write pipeline owns a single
//! dedicated thread, so there is no async runtime to cooperate with. The
//! optional TimescaleDB (time partitioning) and PostGIS (location column)
//! extensions are detected at bootstrap; `ltree` is required.

mod attributes;
mod bootstrap;
mod migrate;
mod probe;
mod schema;
mod session;

pub mod error;

pub use attributes::AttributeStore;
pub use bootstrap::{
  Bootstrapped, Capabilities, DEFAULT_CHUNK_TIME_INTERVAL, PostgresConfig, PostgresConnector, bootstrap,
};
pub use error::{Error, Result};
pub use migrate::{MigrationReport, MigrationStep, Migrator};
pub use session::PostgresSession;
