//! [`PostgresSession`], the write side of the store.

use chrono::{DateTime, Utc};
use ltss_core::{
  sample::{AttributeSet, Point, SchemaMode, StateSample},
  store::{Session, WriteError, WriteOutcome},
};
use postgres::{Client, GenericClient, NoTls, Statement, types::ToSql};
use tracing::{debug, info};

use crate::{
  AttributeStore, Result,
  error::is_connectivity,
  schema::STATES_TABLE,
};

// ─── Rows ────────────────────────────────────────────────────────────────────

/// A states-table row as bound to the insert statement. Separate from
/// [`StateSample`] because rows backfilled from the legacy table may carry a
/// `NULL` state.
pub(crate) struct SampleRow<'a> {
  pub time:       DateTime<Utc>,
  pub entity_id:  &'a str,
  pub state:      Option<&'a str>,
  pub attributes: Option<&'a AttributeSet>,
  pub location:   Option<Point>,
}

impl<'a> From<&'a StateSample> for SampleRow<'a> {
  fn from(s: &'a StateSample) -> Self {
    Self {
      time:       s.time,
      entity_id:  s.entity_id.as_str(),
      state:      Some(s.state.as_str()),
      attributes: s.attributes.as_ref(),
      location:   s.location,
    }
  }
}

/// Everything needed to write one sample, prepared once per connection.
pub(crate) struct SampleStatements {
  insert:     Statement,
  attributes: AttributeStore,
  location:   bool,
}

impl SampleStatements {
  pub fn prepare(c: &mut impl GenericClient, location: bool) -> Result<Self, postgres::Error> {
    let sql = if location {
      format!(
        "INSERT INTO {STATES_TABLE} (time, entity_id, state, attributes_key, location)
         VALUES ($1, $2::text, $3::text, $4::text::ltree,
                 CASE WHEN $5::float8 IS NULL OR $6::float8 IS NULL THEN NULL
                      ELSE ST_SetSRID(ST_MakePoint($5::float8, $6::float8), 4326) END)
         ON CONFLICT DO NOTHING"
      )
    } else {
      format!(
        "INSERT INTO {STATES_TABLE} (time, entity_id, state, attributes_key)
         VALUES ($1, $2::text, $3::text, $4::text::ltree)
         ON CONFLICT DO NOTHING"
      )
    };
    Ok(Self {
      insert: c.prepare(&sql)?,
      attributes: AttributeStore::prepare(c)?,
      location,
    })
  }

  /// Upsert the attribute set, then insert the sample. Must run inside a
  /// transaction: a duplicate sample releases the set it just created, so no
  /// unreferenced row is ever committed.
  pub fn write(&self, c: &mut impl GenericClient, row: SampleRow<'_>) -> Result<WriteOutcome, postgres::Error> {
    let fresh = match row.attributes {
      Some(set) => self.attributes.upsert(c, set)?,
      None => false,
    };

    let key = row.attributes.map(|set| set.key.as_str());
    let longitude = row.location.map(|p| p.longitude);
    let latitude = row.location.map(|p| p.latitude);
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&row.time, &row.entity_id, &row.state, &key];
    if self.location {
      params.push(&longitude);
      params.push(&latitude);
    }

    if c.execute(&self.insert, &params)? == 1 {
      return Ok(WriteOutcome::Inserted);
    }
    if fresh && let Some(set) = row.attributes {
      self.attributes.release_orphan(c, &set.key)?;
    }
    Ok(WriteOutcome::Duplicate)
  }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// A bootstrapped connection owned by the write pipeline.
///
/// If the server drops the connection, the next write reconnects (without
/// re-running migrations) and re-prepares its statements.
pub struct PostgresSession {
  client:     Client,
  config:     postgres::Config,
  statements: SampleStatements,
  mode:       SchemaMode,
}

impl PostgresSession {
  pub(crate) fn new(mut client: Client, config: postgres::Config, mode: SchemaMode) -> Result<Self> {
    let statements = SampleStatements::prepare(&mut client, mode.location)?;
    Ok(Self { client, config, statements, mode })
  }

  fn ensure_open(&mut self) -> Result<(), postgres::Error> {
    if !self.client.is_closed() {
      return Ok(());
    }
    info!("database connection lost, reconnecting");
    let mut client = self.config.connect(NoTls)?;
    let statements = SampleStatements::prepare(&mut client, self.mode.location)?;
    self.client = client;
    self.statements = statements;
    Ok(())
  }

  fn write_sample(&mut self, sample: &StateSample) -> Result<WriteOutcome, postgres::Error> {
    self.ensure_open()?;
    let mut tx = self.client.transaction()?;
    let outcome = self.statements.write(&mut tx, SampleRow::from(sample))?;
    tx.commit()?;
    Ok(outcome)
  }
}

impl Session for PostgresSession {
  fn mode(&self) -> SchemaMode { self.mode }

  fn write(&mut self, sample: &StateSample) -> Result<WriteOutcome, WriteError> {
    self.write_sample(sample).map_err(|e| {
      if is_connectivity(&e) {
        WriteError::Transient(Box::new(e))
      } else {
        WriteError::Permanent(Box::new(e))
      }
    })
  }

  fn close(self) {
    if let Err(e) = self.client.close() {
      debug!(error = %e, "error while closing database connection");
    }
  }
}
