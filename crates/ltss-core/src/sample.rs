//! Rows produced from inbound events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
  Error, Result,
  entity::EntityId,
  event::NewState,
  fingerprint::{AttributesKey, fingerprint},
};

/// Schema variant of the target store, decided once at bootstrap and fixed
/// for the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMode {
  /// The states table carries a `location` column; `latitude`/`longitude`
  /// are moved out of the payload into it.
  pub location: bool,
}

/// A WGS 84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
  pub longitude: f64,
  pub latitude:  f64,
}

/// A deduplicated payload together with its content key.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSet {
  pub key:     AttributesKey,
  pub payload: Map<String, Value>,
}

/// One observed state of one entity at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSample {
  pub time:       DateTime<Utc>,
  pub entity_id:  EntityId,
  pub state:      String,
  /// `None` when the event carried no metadata.
  pub attributes: Option<AttributeSet>,
  pub location:   Option<Point>,
}

impl StateSample {
  /// Build the row for `state` observed at `time`.
  ///
  /// Fails with [`Error::PayloadEncoding`] when the payload cannot be stored
  /// as `jsonb`; nothing of the sample is kept in that case.
  pub fn from_state(
    entity_id: EntityId,
    time: DateTime<Utc>,
    state: &NewState,
    mode: SchemaMode,
  ) -> Result<Self> {
    let mut payload = state.attributes.clone();

    let location = if mode.location {
      let latitude = payload.remove("latitude");
      let longitude = payload.remove("longitude");
      match (latitude.as_ref().and_then(finite), longitude.as_ref().and_then(finite)) {
        (Some(latitude), Some(longitude)) => Some(Point { longitude, latitude }),
        _ => None,
      }
    } else {
      None
    };

    let attributes = if payload.is_empty() {
      None
    } else {
      ensure_encodable_object(&payload)?;
      let key = fingerprint(&entity_id, &payload)?;
      Some(AttributeSet { key, payload })
    };

    Ok(Self {
      time,
      entity_id,
      state: state.state.clone(),
      attributes,
      location,
    })
  }
}

fn finite(v: &Value) -> Option<f64> { v.as_f64().filter(|f| f.is_finite()) }

/// `jsonb` has no representation for U+0000, neither in keys nor values.
fn ensure_encodable(value: &Value) -> Result<()> {
  match value {
    Value::String(s) if s.contains('\0') => {
      Err(Error::PayloadEncoding("string contains a NUL character".into()))
    }
    Value::Array(items) => items.iter().try_for_each(ensure_encodable),
    Value::Object(map) => ensure_encodable_object(map),
    _ => Ok(()),
  }
}

fn ensure_encodable_object(map: &Map<String, Value>) -> Result<()> {
  for (key, value) in map {
    if key.contains('\0') {
      return Err(Error::PayloadEncoding(format!("key {key:?} contains a NUL character")));
    }
    ensure_encodable(value)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use serde_json::json;

  use super::*;

  fn new_state(attributes: Value) -> NewState {
    NewState {
      state:      "on".into(),
      attributes: attributes.as_object().cloned().unwrap_or_default(),
    }
  }

  fn sample(attributes: Value, mode: SchemaMode) -> Result<StateSample> {
    StateSample::from_state(
      EntityId::parse("device_tracker.phone").unwrap(),
      Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
      &new_state(attributes),
      mode,
    )
  }

  #[test]
  fn empty_payload_has_no_key() {
    let s = sample(json!({}), SchemaMode::default()).unwrap();
    assert!(s.attributes.is_none());
    assert!(s.location.is_none());
  }

  #[test]
  fn coordinates_stay_in_payload_without_location_mode() {
    let s = sample(json!({"latitude": 52.1, "longitude": 4.3}), SchemaMode::default()).unwrap();
    let attrs = s.attributes.unwrap();
    assert!(attrs.payload.contains_key("latitude"));
    assert!(s.location.is_none());
  }

  #[test]
  fn coordinates_move_to_location_in_location_mode() {
    let mode = SchemaMode { location: true };
    let s = sample(json!({"latitude": 52.1, "longitude": 4.3, "battery": 80}), mode).unwrap();
    assert_eq!(s.location, Some(Point { longitude: 4.3, latitude: 52.1 }));
    let attrs = s.attributes.unwrap();
    assert_eq!(attrs.payload.len(), 1);

    // The key is computed after extraction, so the moving coordinates do not
    // defeat deduplication.
    let moved = sample(json!({"latitude": 48.8, "longitude": 2.3, "battery": 80}), mode).unwrap();
    assert_eq!(attrs.key, moved.attributes.unwrap().key);
  }

  #[test]
  fn zero_coordinates_are_a_valid_point() {
    let s = sample(json!({"latitude": 0.0, "longitude": 0.0}), SchemaMode { location: true }).unwrap();
    assert_eq!(s.location, Some(Point { longitude: 0.0, latitude: 0.0 }));
    assert!(s.attributes.is_none());
  }

  #[test]
  fn partial_or_non_numeric_coordinates_are_dropped() {
    let mode = SchemaMode { location: true };
    let s = sample(json!({"latitude": 52.1}), mode).unwrap();
    assert!(s.location.is_none());
    assert!(s.attributes.is_none());

    let s = sample(json!({"latitude": "north", "longitude": 4.3}), mode).unwrap();
    assert!(s.location.is_none());
  }

  #[test]
  fn nul_characters_reject_the_sample() {
    let err = sample(json!({"name": "a\u{0}b"}), SchemaMode::default()).unwrap_err();
    assert!(matches!(err, Error::PayloadEncoding(_)));

    let err = sample(json!({"nested": [{"k\u{0}": 1}]}), SchemaMode::default()).unwrap_err();
    assert!(matches!(err, Error::PayloadEncoding(_)));
  }
}
