//! Content fingerprints for attribute payloads.
//!
//! A key is `<entity_id>.<sha256 hex>` where the digest is taken over a
//! canonical rendering of the payload: object keys sorted at every depth,
//! compact separators, and `\n`/`\r` stripped from string contents. Two
//! payloads that only differ in formatting or embedded line breaks map to the
//! same key. Digest collisions are treated as equal payloads.

use std::fmt::{self, Write as _};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::{Result, entity::EntityId};

/// Hierarchical key of a deduplicated attribute payload, stored as `ltree`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributesKey(String);

impl AttributesKey {
  pub fn as_str(&self) -> &str { &self.0 }

  /// The hex digest label.
  pub fn digest(&self) -> &str {
    self.0.rsplit_once('.').map_or("", |(_, d)| d)
  }
}

impl fmt::Display for AttributesKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Compute the key for `payload` owned by `entity_id`.
pub fn fingerprint(entity_id: &EntityId, payload: &Map<String, Value>) -> Result<AttributesKey> {
  let digest = Sha256::digest(canonical_form(payload)?.as_bytes());
  Ok(AttributesKey(format!("{entity_id}.{}", hex::encode(digest))))
}

/// The canonical text the digest is computed over.
pub fn canonical_form(payload: &Map<String, Value>) -> Result<String> {
  let mut out = String::new();
  write_object(&mut out, payload)?;
  Ok(out)
}

fn write_value(out: &mut String, value: &Value) -> Result<()> {
  match value {
    Value::Null => out.push_str("null"),
    Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
    Value::Number(n) => {
      let _ = write!(out, "{n}");
    }
    Value::String(s) => write_string(out, s)?,
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_value(out, item)?;
      }
      out.push(']');
    }
    Value::Object(map) => write_object(out, map)?,
  }
  Ok(())
}

fn write_object(out: &mut String, map: &Map<String, Value>) -> Result<()> {
  let mut entries: Vec<_> = map.iter().collect();
  entries.sort_by(|(a, _), (b, _)| a.cmp(b));

  out.push('{');
  for (i, (key, value)) in entries.into_iter().enumerate() {
    if i > 0 {
      out.push(',');
    }
    write_string(out, key)?;
    out.push(':');
    write_value(out, value)?;
  }
  out.push('}');
  Ok(())
}

fn write_string(out: &mut String, s: &str) -> Result<()> {
  let stripped: String = s.chars().filter(|c| !matches!(c, '\n' | '\r')).collect();
  out.push_str(&serde_json::to_string(&stripped)?);
  Ok(())
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn object(v: Value) -> Map<String, Value> {
    match v {
      Value::Object(m) => m,
      _ => panic!("not an object"),
    }
  }

  fn entity() -> EntityId { EntityId::parse("sensor.kitchen").unwrap() }

  #[test]
  fn key_is_entity_prefixed_sha256() {
    let key = fingerprint(&entity(), &object(json!({"unit": "W"}))).unwrap();
    assert!(key.as_str().starts_with("sensor.kitchen."));
    assert_eq!(key.digest().len(), 64);
    assert!(key.digest().bytes().all(|b| b.is_ascii_hexdigit()));
  }

  #[test]
  fn formatting_does_not_change_the_key() {
    let compact: Value = serde_json::from_str(r#"{"b":[1,2],"a":{"y":true,"x":null}}"#).unwrap();
    let spaced: Value = serde_json::from_str(
      "{\n  \"a\" : { \"x\" : null ,\n \"y\" : true },\n  \"b\" : [ 1 , 2 ]\n}",
    )
    .unwrap();
    assert_eq!(
      fingerprint(&entity(), &object(compact)).unwrap(),
      fingerprint(&entity(), &object(spaced)).unwrap(),
    );
  }

  #[test]
  fn embedded_line_breaks_are_ignored() {
    let a = object(json!({"friendly_name": "Kitchen\nSensor"}));
    let b = object(json!({"friendly_name": "Kitchen\r\nSensor"}));
    let c = object(json!({"friendly_name": "KitchenSensor"}));
    let ka = fingerprint(&entity(), &a).unwrap();
    assert_eq!(ka, fingerprint(&entity(), &b).unwrap());
    assert_eq!(ka, fingerprint(&entity(), &c).unwrap());
  }

  #[test]
  fn different_payloads_and_entities_differ() {
    let a = object(json!({"unit": "W"}));
    let b = object(json!({"unit": "kW"}));
    assert_ne!(fingerprint(&entity(), &a).unwrap(), fingerprint(&entity(), &b).unwrap());

    let other = EntityId::parse("sensor.garage").unwrap();
    assert_eq!(
      fingerprint(&entity(), &a).unwrap().digest(),
      fingerprint(&other, &a).unwrap().digest(),
    );
    assert_ne!(fingerprint(&entity(), &a).unwrap(), fingerprint(&other, &a).unwrap());
  }

  #[test]
  fn canonical_form_sorts_nested_keys() {
    let payload = object(json!({"z": 1, "a": {"d": 2, "c": [3, {"f": 4, "e": 5}]}}));
    assert_eq!(
      canonical_form(&payload).unwrap(),
      r#"{"a":{"c":[3,{"e":5,"f":4}],"d":2},"z":1}"#,
    );
  }
}
