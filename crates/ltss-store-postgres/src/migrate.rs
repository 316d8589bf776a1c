//! Introspection-driven schema migration.
//!
//! Each step probes the live catalog, does nothing if its target state is
//! already present, and otherwise applies its change in its own transaction.
//! A failing step aborts the run; re-running from the top is always safe.

use std::fmt;

use chrono::{DateTime, Utc};
use ltss_core::{
  entity::EntityId,
  fingerprint::fingerprint,
  sample::{AttributeSet, Point},
  store::WriteOutcome,
};
use postgres::{Client, GenericClient, Transaction};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
  Capabilities, Error, Result, attributes, probe,
  schema::{self, *},
  session::{SampleRow, SampleStatements},
};

/// Rows fetched per round trip while backfilling the legacy table.
const BACKFILL_BATCH: i32 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
  CreateTables,
  CreateHypertable,
  /// `discarded_attributes` counts copied rows whose legacy payload could
  /// not be keyed and was left behind.
  SplitLegacyTable { rows: u64, discarded_attributes: u64 },
  UpgradePayloadColumn,
  KeyAttributesTable,
  ConstrainRefCount,
  CreateIndex(String),
  DropRedundantIndex(String),
  DropSurrogateKey,
  InstallRefCountTriggers,
  ReconcileRefCounts { updated: u64, deleted: u64 },
  CreateCompatibilityView,
}

impl fmt::Display for MigrationStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::CreateTables => f.write_str("create tables"),
      Self::CreateHypertable => f.write_str("create hypertable"),
      Self::SplitLegacyTable { rows, discarded_attributes: 0 } => write!(f, "split legacy table ({rows} rows)"),
      Self::SplitLegacyTable { rows, discarded_attributes } => {
        write!(f, "split legacy table ({rows} rows, attributes discarded on {discarded_attributes})")
      }
      Self::UpgradePayloadColumn => f.write_str("convert attributes to jsonb"),
      Self::KeyAttributesTable => f.write_str("add unique key on attributes_key"),
      Self::ConstrainRefCount => f.write_str("make ref_count not null with default 0"),
      Self::CreateIndex(name) => write!(f, "create index {name}"),
      Self::DropRedundantIndex(name) => write!(f, "drop index {name}"),
      Self::DropSurrogateKey => f.write_str("drop surrogate id column"),
      Self::InstallRefCountTriggers => f.write_str("install reference counting triggers"),
      Self::ReconcileRefCounts { updated, deleted } => {
        write!(f, "reconcile reference counts ({updated} corrected, {deleted} orphans deleted)")
      }
      Self::CreateCompatibilityView => f.write_str("create compatibility view"),
    }
  }
}

/// Steps applied by one [`Migrator::run`]. Empty when the store was already
/// at the current shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
  pub applied: Vec<MigrationStep>,
}

impl MigrationReport {
  pub fn is_empty(&self) -> bool { self.applied.is_empty() }

  fn push(&mut self, step: MigrationStep) {
    info!(%step, "applied migration step");
    self.applied.push(step);
  }
}

pub struct Migrator {
  capabilities:        Capabilities,
  chunk_time_interval: i64,
}

impl Migrator {
  pub fn new(capabilities: Capabilities, chunk_time_interval: i64) -> Self {
    Self { capabilities, chunk_time_interval }
  }

  /// Bring the store to the current shape.
  pub fn run(&self, client: &mut Client) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    self.ensure_tables(client, &mut report)?;
    self.upgrade_payload_column(client, &mut report)?;
    self.ensure_attributes_key(client, &mut report)?;
    self.constrain_ref_count(client, &mut report)?;
    self.ensure_indexes(client, &mut report)?;
    self.ensure_ref_count_triggers(client, &mut report)?;
    self.drop_surrogate_key(client, &mut report)?;
    self.reconcile_ref_counts(client, &mut report)?;
    self.ensure_compat_view(client, &mut report)?;
    Ok(report)
  }

  // ── Step 1/2: tables ───────────────────────────────────────────────────

  fn ensure_tables(&self, client: &mut Client, report: &mut MigrationReport) -> Result<()> {
    let mut tx = client.transaction()?;
    let states = probe::table_exists(&mut tx, STATES_TABLE)?;
    let attributes = probe::table_exists(&mut tx, ATTRIBUTES_TABLE)?;
    if states && attributes {
      return Ok(());
    }
    let legacy = probe::table_exists(&mut tx, LEGACY_TABLE)?;

    if legacy && !states && !attributes {
      let (rows, discarded_attributes) = self.split_legacy_table(&mut tx, report)?;
      tx.commit()?;
      report.push(MigrationStep::SplitLegacyTable { rows, discarded_attributes });
      warn!(
        "the old table has been renamed to `{LEGACY_BACKUP_TABLE}` and all data was migrated; \
         it is not deleted automatically, once everything works run: DROP TABLE {LEGACY_BACKUP_TABLE};"
      );
      return Ok(());
    }

    if legacy {
      warn!("found legacy table `{LEGACY_TABLE}` next to a partial new schema; leaving it untouched");
    }
    if !states {
      tx.batch_execute(&schema::create_states_table(self.capabilities.postgis))?;
    }
    if !attributes {
      tx.batch_execute(CREATE_ATTRIBUTES_TABLE)?;
    }
    let hypertable = !states && self.create_hypertable(&mut tx)?;
    tx.commit()?;
    report.push(MigrationStep::CreateTables);
    if hypertable {
      report.push(MigrationStep::CreateHypertable);
    }
    Ok(())
  }

  /// Partition a freshly created, still empty states table by time.
  fn create_hypertable(&self, tx: &mut Transaction<'_>) -> Result<bool> {
    if !self.capabilities.timescale {
      return Ok(false);
    }
    tx.execute(CREATE_HYPERTABLE, &[&self.chunk_time_interval])?;
    Ok(true)
  }

  /// Move the single-table shape into the two-table shape inside the
  /// caller's transaction. The old table is kept, renamed.
  fn split_legacy_table(
    &self,
    tx: &mut Transaction<'_>,
    report: &mut MigrationReport,
  ) -> Result<(u64, u64)> {
    warn!("migrating the old `{LEGACY_TABLE}` table to the two table schema, this might take a while");

    if probe::relation_kind(tx, LEGACY_BACKUP_TABLE)?.is_some() {
      return Err(Error::Migration(format!(
        "cannot rename `{LEGACY_TABLE}`: a relation named `{LEGACY_BACKUP_TABLE}` already exists"
      )));
    }
    let legacy_location = probe::column_type(tx, LEGACY_TABLE, "location")?.is_some();
    let location = legacy_location || self.capabilities.postgis;

    tx.batch_execute(&format!("ALTER TABLE {LEGACY_TABLE} RENAME TO {LEGACY_BACKUP_TABLE}"))?;
    tx.batch_execute(&schema::create_states_table(location))?;
    tx.batch_execute(CREATE_ATTRIBUTES_TABLE)?;
    if self.create_hypertable(tx)? {
      report.push(MigrationStep::CreateHypertable);
    }
    // Counts are maintained by the triggers while backfilling.
    if attributes::install_ref_count_triggers(tx)? {
      report.push(MigrationStep::InstallRefCountTriggers);
    }

    let counts = backfill(tx, legacy_location, location)?;

    tx.batch_execute(&schema::create_compat_view(location))?;
    report.push(MigrationStep::CreateCompatibilityView);
    Ok(counts)
  }

  // ── Step 3: payload type ───────────────────────────────────────────────

  fn upgrade_payload_column(&self, client: &mut Client, report: &mut MigrationReport) -> Result<()> {
    let mut tx = client.transaction()?;
    let ty = probe::column_type(&mut tx, ATTRIBUTES_TABLE, "attributes")?;
    if !matches!(ty.as_deref(), Some("text" | "varchar" | "bpchar" | "json")) {
      return Ok(());
    }
    // The view depends on the column; the view step recreates it.
    if probe::view_exists(&mut tx, COMPAT_VIEW)? {
      tx.batch_execute(&format!("DROP VIEW {COMPAT_VIEW}"))?;
    }
    tx.batch_execute(&format!(
      "ALTER TABLE {ATTRIBUTES_TABLE} ALTER COLUMN attributes TYPE jsonb USING attributes::text::jsonb"
    ))?;
    tx.commit()?;
    report.push(MigrationStep::UpgradePayloadColumn);
    Ok(())
  }

  // ── Step 4: attribute table constraints ────────────────────────────────

  /// Stores created with an `EXCLUDE USING gist (attributes_key WITH =)`
  /// constraint have no index `ON CONFLICT (attributes_key)` can infer.
  fn ensure_attributes_key(&self, client: &mut Client, report: &mut MigrationReport) -> Result<()> {
    let mut tx = client.transaction()?;
    if probe::unique_index_on(&mut tx, ATTRIBUTES_TABLE, "attributes_key")? {
      return Ok(());
    }

    let keyless = tx.execute(&format!("DELETE FROM {ATTRIBUTES_TABLE} WHERE attributes_key IS NULL"), &[])?;
    let duplicates = tx.execute(
      &format!(
        "DELETE FROM {ATTRIBUTES_TABLE} a USING {ATTRIBUTES_TABLE} b
          WHERE a.attributes_key = b.attributes_key AND a.ctid > b.ctid"
      ),
      &[],
    )?;
    if keyless > 0 || duplicates > 0 {
      warn!(keyless, duplicates, "removed attribute rows before adding the unique key");
    }
    let constraint = if probe::primary_key_name(&mut tx, ATTRIBUTES_TABLE)?.is_some() {
      "UNIQUE"
    } else {
      "PRIMARY KEY"
    };
    tx.batch_execute(&format!("ALTER TABLE {ATTRIBUTES_TABLE} ADD {constraint} (attributes_key)"))?;
    for name in probe::exclusion_constraints(&mut tx, ATTRIBUTES_TABLE)? {
      tx.batch_execute(&format!("ALTER TABLE {ATTRIBUTES_TABLE} DROP CONSTRAINT {name}"))?;
      debug!(constraint = %name, "dropped exclusion constraint");
    }
    tx.commit()?;
    report.push(MigrationStep::KeyAttributesTable);
    Ok(())
  }

  /// `ref_count` must be `NOT NULL DEFAULT 0`; a NULL count never reaches
  /// zero, so its payload would never be deleted.
  fn constrain_ref_count(&self, client: &mut Client, report: &mut MigrationReport) -> Result<()> {
    let mut tx = client.transaction()?;
    match probe::column_constraints(&mut tx, ATTRIBUTES_TABLE, "ref_count")? {
      Some((false, Some(_))) => return Ok(()),
      Some(_) => tx.batch_execute(&format!(
        "UPDATE {ATTRIBUTES_TABLE} SET ref_count = 0 WHERE ref_count IS NULL;
         ALTER TABLE {ATTRIBUTES_TABLE} ALTER COLUMN ref_count SET DEFAULT 0;
         ALTER TABLE {ATTRIBUTES_TABLE} ALTER COLUMN ref_count SET NOT NULL;"
      ))?,
      None => tx.batch_execute(&format!(
        "ALTER TABLE {ATTRIBUTES_TABLE} ADD COLUMN ref_count BIGINT NOT NULL DEFAULT 0"
      ))?,
    }
    let counts = attributes::reconcile_ref_counts(&mut tx)?;
    tx.commit()?;
    report.push(MigrationStep::ConstrainRefCount);
    push_reconciled(report, counts);
    Ok(())
  }

  // ── Step 5: indexes ────────────────────────────────────────────────────

  fn ensure_indexes(&self, client: &mut Client, report: &mut MigrationReport) -> Result<()> {
    let mut tx = client.transaction()?;
    let mut changed = Vec::new();

    for (name, ddl) in [
      (ATTRIBUTES_INDEX, CREATE_ATTRIBUTES_INDEX),
      (ENTITY_TIME_INDEX, CREATE_ENTITY_TIME_INDEX),
    ] {
      if !probe::index_exists(&mut tx, name)? {
        tx.batch_execute(ddl)?;
        changed.push(MigrationStep::CreateIndex(name.to_owned()));
      }
    }

    // Covered by the composite index.
    for name in probe::single_column_indexes(&mut tx, STATES_TABLE, "entity_id")? {
      tx.batch_execute(&format!("DROP INDEX {name}"))?;
      changed.push(MigrationStep::DropRedundantIndex(name));
    }

    tx.commit()?;
    for step in changed {
      report.push(step);
    }
    Ok(())
  }

  // ── Step 6: triggers ───────────────────────────────────────────────────

  /// Runs before the surrogate key step so its deletes are counted. Counts
  /// kept by missing or outdated functions are recomputed.
  fn ensure_ref_count_triggers(&self, client: &mut Client, report: &mut MigrationReport) -> Result<()> {
    let mut tx = client.transaction()?;
    if !attributes::install_ref_count_triggers(&mut tx)? {
      return Ok(());
    }
    let counts = attributes::reconcile_ref_counts(&mut tx)?;
    tx.commit()?;
    report.push(MigrationStep::InstallRefCountTriggers);
    push_reconciled(report, counts);
    Ok(())
  }

  // ── Step 7: surrogate key ──────────────────────────────────────────────

  fn drop_surrogate_key(&self, client: &mut Client, report: &mut MigrationReport) -> Result<()> {
    let mut tx = client.transaction()?;
    if probe::column_type(&mut tx, STATES_TABLE, "id")?.is_none() {
      return Ok(());
    }

    let removed = tx.execute(
      &format!(
        "DELETE FROM {STATES_TABLE} a USING {STATES_TABLE} b
          WHERE a.time = b.time AND a.entity_id = b.entity_id AND a.id > b.id"
      ),
      &[],
    )?;
    if removed > 0 {
      warn!(removed, "removed samples sharing (time, entity_id) before changing the primary key");
    }
    if let Some(pkey) = probe::primary_key_name(&mut tx, STATES_TABLE)? {
      tx.batch_execute(&format!("ALTER TABLE {STATES_TABLE} DROP CONSTRAINT {pkey}"))?;
    }
    tx.batch_execute(&format!(
      "ALTER TABLE {STATES_TABLE} DROP COLUMN id;
       ALTER TABLE {STATES_TABLE} ADD PRIMARY KEY (time, entity_id);"
    ))?;
    let counts = attributes::reconcile_ref_counts(&mut tx)?;
    tx.commit()?;
    report.push(MigrationStep::DropSurrogateKey);
    push_reconciled(report, counts);
    Ok(())
  }

  // ── Step 8: counts ─────────────────────────────────────────────────────

  /// A live row with a count of zero or less means counts drifted.
  fn reconcile_ref_counts(&self, client: &mut Client, report: &mut MigrationReport) -> Result<()> {
    let mut tx = client.transaction()?;
    let row = tx.query_one(
      &format!("SELECT EXISTS (SELECT 1 FROM {ATTRIBUTES_TABLE} WHERE ref_count <= 0)"),
      &[],
    )?;
    if !row.get::<_, bool>(0) {
      return Ok(());
    }
    let counts = attributes::reconcile_ref_counts(&mut tx)?;
    tx.commit()?;
    push_reconciled(report, counts);
    Ok(())
  }

  // ── Step 9: view ───────────────────────────────────────────────────────

  fn ensure_compat_view(&self, client: &mut Client, report: &mut MigrationReport) -> Result<()> {
    let mut tx = client.transaction()?;
    match probe::relation_kind(&mut tx, COMPAT_VIEW)?.as_deref() {
      None => {}
      Some("v") => return Ok(()),
      Some(_) => {
        debug!("`{COMPAT_VIEW}` is a table, not creating the compatibility view");
        return Ok(());
      }
    }
    let location = probe::column_type(&mut tx, STATES_TABLE, "location")?.is_some();
    tx.batch_execute(&schema::create_compat_view(location))?;
    tx.commit()?;
    report.push(MigrationStep::CreateCompatibilityView);
    Ok(())
  }
}

fn push_reconciled(report: &mut MigrationReport, (updated, deleted): (u64, u64)) {
  if updated > 0 || deleted > 0 {
    report.push(MigrationStep::ReconcileRefCounts { updated, deleted });
  }
}

// ─── Backfill ────────────────────────────────────────────────────────────────

/// Copy every legacy row into the new tables, fingerprinting payloads with the
/// same function the write path uses so old and new samples share keys.
///
/// Returns the rows copied and how many of them lost their attributes.
fn backfill(tx: &mut Transaction<'_>, legacy_location: bool, location: bool) -> Result<(u64, u64)> {
  let coordinates = if legacy_location {
    "ST_X(location)::float8, ST_Y(location)::float8"
  } else {
    "NULL::float8, NULL::float8"
  };
  let select = format!(
    "SELECT time, entity_id::text, state::text, NULLIF(attributes::text, '')::jsonb, {coordinates}
       FROM {LEGACY_BACKUP_TABLE}"
  );

  let statements = SampleStatements::prepare(tx, location)?;
  let portal = tx.bind(select.as_str(), &[])?;
  let mut copied = 0u64;
  let mut discarded = 0u64;

  loop {
    let rows = tx.query_portal(&portal, BACKFILL_BATCH)?;
    if rows.is_empty() {
      break;
    }
    for row in &rows {
      let time: DateTime<Utc> = row.get(0);
      let entity_id: String = row.get(1);
      let state: Option<String> = row.get(2);
      let payload: Option<Value> = row.get(3);
      let longitude: Option<f64> = row.get(4);
      let latitude: Option<f64> = row.get(5);

      let attributes = match legacy_attribute_set(&entity_id, payload)? {
        LegacyAttributes::None => None,
        LegacyAttributes::Set(set) => Some(set),
        LegacyAttributes::Discarded => {
          discarded += 1;
          None
        }
      };
      let sample = SampleRow {
        time,
        entity_id: &entity_id,
        state: state.as_deref(),
        attributes: attributes.as_ref(),
        location: longitude.zip(latitude).map(|(longitude, latitude)| Point { longitude, latitude }),
      };
      if statements.write(tx, sample)? == WriteOutcome::Inserted {
        copied += 1;
      }
    }
    debug!(copied, discarded, "backfilled batch");
  }
  if discarded > 0 {
    warn!(discarded, "legacy rows were copied without their attributes");
  }
  Ok((copied, discarded))
}

enum LegacyAttributes {
  None,
  Set(AttributeSet),
  Discarded,
}

fn legacy_attribute_set(entity_id: &str, payload: Option<Value>) -> Result<LegacyAttributes> {
  let payload = match payload {
    Some(Value::Object(map)) if !map.is_empty() => map,
    Some(Value::Object(_)) | None => return Ok(LegacyAttributes::None),
    Some(other) => {
      debug!(entity_id, "legacy attributes are not an object, dropping them: {other}");
      return Ok(LegacyAttributes::Discarded);
    }
  };
  let Ok(id) = EntityId::parse(entity_id) else {
    debug!(entity_id, "legacy row has an entity id that cannot key its attributes, dropping them");
    return Ok(LegacyAttributes::Discarded);
  };
  let key = fingerprint(&id, &payload)?;
  Ok(LegacyAttributes::Set(AttributeSet { key, payload }))
}
