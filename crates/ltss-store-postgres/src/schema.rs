//! Names and DDL of the persisted schema.
//!
//! Table and column names are part of the on-disk contract with downstream
//! readers and must not change.

pub const STATES_TABLE: &str = "ltss_hass";
pub const ATTRIBUTES_TABLE: &str = "ltss_hass_attributes";

/// Pre-split single-table shape. After the split its name is taken by the
/// compatibility view.
pub const LEGACY_TABLE: &str = "ltss";
pub const LEGACY_BACKUP_TABLE: &str = "ltss_old";
pub const COMPAT_VIEW: &str = "ltss";

pub const ATTRIBUTES_INDEX: &str = "ltss_hass_attributes_attributes_idx";
pub const ENTITY_TIME_INDEX: &str = "ltss_hass_entityid_time_composite_idx";

pub fn create_states_table(location: bool) -> String {
  let location_column = if location {
    "\n    location       GEOMETRY(POINT, 4326),"
  } else {
    ""
  };
  format!(
    "CREATE TABLE {STATES_TABLE} (
    time           TIMESTAMPTZ NOT NULL,
    entity_id      TEXT        NOT NULL,
    state          TEXT,
    attributes_key LTREE,{location_column}
    PRIMARY KEY (time, entity_id)
)"
  )
}

pub const CREATE_ATTRIBUTES_TABLE: &str = "
CREATE TABLE ltss_hass_attributes (
    attributes_key LTREE  PRIMARY KEY,
    attributes     JSONB  NOT NULL,
    ref_count      BIGINT NOT NULL DEFAULT 0
)";

pub const CREATE_ATTRIBUTES_INDEX: &str =
  "CREATE INDEX ltss_hass_attributes_attributes_idx ON ltss_hass_attributes USING gin (attributes)";

pub const CREATE_ENTITY_TIME_INDEX: &str =
  "CREATE INDEX ltss_hass_entityid_time_composite_idx ON ltss_hass (entity_id, time DESC)";

/// Reproduces the pre-split `ltss` shape, including its `id` column.
pub fn create_compat_view(location: bool) -> String {
  let location_column = if location { "\n       s.location," } else { "" };
  format!(
    "CREATE VIEW {COMPAT_VIEW} AS
SELECT row_number() OVER (ROWS UNBOUNDED PRECEDING) AS id,
       s.time,
       s.entity_id,
       s.state,{location_column}
       a.attributes
  FROM {STATES_TABLE} s
  LEFT JOIN {ATTRIBUTES_TABLE} a ON a.attributes_key = s.attributes_key"
  )
}

pub const CREATE_HYPERTABLE: &str = "SELECT create_hypertable('ltss_hass', 'time', \
  chunk_time_interval => $1::bigint, if_not_exists => TRUE)";

pub const SET_CHUNK_TIME_INTERVAL: &str = "SELECT set_chunk_time_interval('ltss_hass', $1::bigint)";
