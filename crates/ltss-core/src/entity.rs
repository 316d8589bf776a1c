//! Entity identifiers of the form `<domain>.<object_id>`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Identifier of an observed entity, e.g. `sensor.kitchen_temperature`.
///
/// Both labels are restricted to lowercase ASCII letters, digits and `_` so
/// that the id can be used verbatim as the leading labels of an `ltree` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
  pub fn parse(raw: &str) -> Result<Self> {
    let (domain, object_id) = raw
      .split_once('.')
      .ok_or_else(|| Error::InvalidEntityId(raw.to_owned()))?;
    if !valid_label(domain) || !valid_label(object_id) {
      return Err(Error::InvalidEntityId(raw.to_owned()));
    }
    Ok(Self(raw.to_owned()))
  }

  pub fn as_str(&self) -> &str { &self.0 }

  /// The part before the dot (`sensor` in `sensor.kitchen`).
  pub fn domain(&self) -> &str {
    self.0.split_once('.').map_or(self.0.as_str(), |(d, _)| d)
  }
}

fn valid_label(label: &str) -> bool {
  !label.is_empty()
    && label
      .bytes()
      .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl FromStr for EntityId {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

impl AsRef<str> for EntityId {
  fn as_ref(&self) -> &str { &self.0 }
}

impl Serialize for EntityId {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&self.0)
  }
}

impl<'de> Deserialize<'de> for EntityId {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(d)?;
    Self::parse(&raw).map_err(serde::de::Error::custom)
  }
}
