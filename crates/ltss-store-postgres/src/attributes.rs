//! Deduplicated attribute payloads and their reference counts.
//!
//! The application only ever inserts attribute rows. `ref_count` is owned by
//! two row triggers on the states table, so it stays correct when samples are
//! deleted by retention jobs or by hand, and under any number of concurrent
//! writers.

use ltss_core::{fingerprint::AttributesKey, sample::AttributeSet};
use postgres::{GenericClient, Statement, types::Json};
use tracing::info;

use crate::{
  Result, probe,
  schema::{ATTRIBUTES_TABLE, STATES_TABLE},
};

pub const INCREMENT_FUNCTION: &str = "ltss_hass_attributes_ref_count_increment";
pub const DECREMENT_FUNCTION: &str = "ltss_hass_attributes_ref_count_decrement";
pub const INCREMENT_TRIGGER: &str = "trg_ltss_hass_attributes_ref_count_increment";
pub const DECREMENT_TRIGGER: &str = "trg_ltss_hass_attributes_ref_count_decrement";

// A key change on update moves one reference from the old row to the new.
const INCREMENT_BODY: &str = "
BEGIN
  IF TG_OP = 'UPDATE' AND OLD.attributes_key IS NOT DISTINCT FROM NEW.attributes_key THEN
    RETURN NULL;
  END IF;

  IF NEW.attributes_key IS NOT NULL THEN
    UPDATE ltss_hass_attributes
       SET ref_count = ref_count + 1
     WHERE attributes_key = NEW.attributes_key;
  END IF;

  IF TG_OP = 'UPDATE' AND OLD.attributes_key IS NOT NULL THEN
    UPDATE ltss_hass_attributes
       SET ref_count = ref_count - 1
     WHERE attributes_key = OLD.attributes_key;
    DELETE FROM ltss_hass_attributes
     WHERE attributes_key = OLD.attributes_key AND ref_count <= 0;
  END IF;

  RETURN NULL;
END;
";

const DECREMENT_BODY: &str = "
BEGIN
  IF OLD.attributes_key IS NULL THEN
    RETURN NULL;
  END IF;

  UPDATE ltss_hass_attributes
     SET ref_count = ref_count - 1
   WHERE attributes_key = OLD.attributes_key;
  DELETE FROM ltss_hass_attributes
   WHERE attributes_key = OLD.attributes_key AND ref_count <= 0;

  RETURN NULL;
END;
";

fn create_function(name: &str, body: &str) -> String {
  format!("CREATE OR REPLACE FUNCTION {name}() RETURNS trigger LANGUAGE plpgsql AS $${body}$$")
}

// EXECUTE PROCEDURE rather than EXECUTE FUNCTION keeps PostgreSQL < 11 working.
const CREATE_INCREMENT_TRIGGER: &str = "
CREATE TRIGGER trg_ltss_hass_attributes_ref_count_increment
AFTER INSERT OR UPDATE OF attributes_key ON ltss_hass
FOR EACH ROW EXECUTE PROCEDURE ltss_hass_attributes_ref_count_increment()";

const CREATE_DECREMENT_TRIGGER: &str = "
CREATE TRIGGER trg_ltss_hass_attributes_ref_count_decrement
AFTER DELETE ON ltss_hass
FOR EACH ROW EXECUTE PROCEDURE ltss_hass_attributes_ref_count_decrement()";

/// Install whichever of the two triggers is missing, by name, and (re)create
/// either function whose body is not the current one. Returns `true` if
/// anything changed.
pub fn install_ref_count_triggers(c: &mut impl GenericClient) -> Result<bool> {
  let mut installed = false;
  for (name, body) in [(INCREMENT_FUNCTION, INCREMENT_BODY), (DECREMENT_FUNCTION, DECREMENT_BODY)] {
    let current = probe::function_source(c, name)?;
    if current.as_deref() != Some(body) {
      c.batch_execute(&create_function(name, body))?;
      let action = if current.is_some() { "replaced" } else { "installed" };
      info!(object = name, "{action} reference counting function");
      installed = true;
    }
  }
  for (name, ddl) in [(INCREMENT_TRIGGER, CREATE_INCREMENT_TRIGGER), (DECREMENT_TRIGGER, CREATE_DECREMENT_TRIGGER)] {
    if !probe::trigger_exists(c, STATES_TABLE, name)? {
      c.batch_execute(ddl)?;
      info!(object = name, "installed reference counting trigger");
      installed = true;
    }
  }
  Ok(installed)
}

/// Recompute every `ref_count` from the states table and delete payloads
/// nothing references. Returns the number of rows updated and deleted.
pub fn reconcile_ref_counts(c: &mut impl GenericClient) -> Result<(u64, u64)> {
  let updated = c.execute(
    &format!(
      "UPDATE {ATTRIBUTES_TABLE} a
          SET ref_count = r.n
         FROM (SELECT attributes_key, count(*) AS n
                 FROM {STATES_TABLE}
                WHERE attributes_key IS NOT NULL
                GROUP BY attributes_key) r
        WHERE a.attributes_key = r.attributes_key
          AND a.ref_count IS DISTINCT FROM r.n"
    ),
    &[],
  )?;
  let deleted = c.execute(
    &format!(
      "DELETE FROM {ATTRIBUTES_TABLE} a
        WHERE NOT EXISTS (
          SELECT 1 FROM {STATES_TABLE} s WHERE s.attributes_key = a.attributes_key)"
    ),
    &[],
  )?;
  Ok((updated, deleted))
}

/// Prepared statements for the application side of the attribute table.
pub struct AttributeStore {
  upsert:  Statement,
  release: Statement,
}

impl AttributeStore {
  pub fn prepare(c: &mut impl GenericClient) -> Result<Self, postgres::Error> {
    let upsert = c.prepare(&format!(
      "INSERT INTO {ATTRIBUTES_TABLE} (attributes_key, attributes, ref_count)
       VALUES ($1::text::ltree, $2::jsonb, 0)
       ON CONFLICT (attributes_key) DO NOTHING"
    ))?;
    let release = c.prepare(&format!(
      "DELETE FROM {ATTRIBUTES_TABLE}
        WHERE attributes_key = $1::text::ltree AND ref_count <= 0"
    ))?;
    Ok(Self { upsert, release })
  }

  /// Insert the set unless its key is already present. Neither the payload
  /// nor the count of an existing row is touched.
  ///
  /// Returns `true` if a new row was inserted.
  pub fn upsert(
    &self,
    c: &mut impl GenericClient,
    set: &AttributeSet,
  ) -> Result<bool, postgres::Error> {
    let inserted = c.execute(&self.upsert, &[&set.key.as_str(), &Json(&set.payload)])?;
    Ok(inserted == 1)
  }

  /// Delete the row for `key` if nothing references it. Used when the sample
  /// that was meant to reference a freshly inserted set turned out to be a
  /// duplicate.
  pub fn release_orphan(
    &self,
    c: &mut impl GenericClient,
    key: &AttributesKey,
  ) -> Result<bool, postgres::Error> {
    Ok(c.execute(&self.release, &[&key.as_str()])? == 1)
  }
}
