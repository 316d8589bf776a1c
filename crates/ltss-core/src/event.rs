//! Inbound state-change notifications as delivered by the host platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// State value the host reports for entities it has no reading for. Samples
/// carrying it are never recorded.
pub const STATE_UNKNOWN: &str = "unknown";

/// A `state_changed` notification.
///
/// `entity_id` is kept unparsed here; the ingestion adapter validates it and
/// discards events whose id is malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedEvent {
  pub entity_id:  String,
  /// `None` when the entity was removed.
  pub new_state:  Option<NewState>,
  pub time_fired: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewState {
  pub state:      String,
  #[serde(default)]
  pub attributes: Map<String, Value>,
}
