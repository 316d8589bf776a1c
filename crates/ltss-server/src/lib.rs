//! HTTP ingestion surface for the recorder.
//!
//! `POST /api/events` accepts `state_changed` events in the host's shape,
//! one object or an array of them. `GET /health` reports the pipeline state
//! and counters.

pub mod auth;
pub mod error;
pub mod settings;

pub use error::ApiError;
pub use settings::ServerConfig;

use std::sync::Arc;

use axum::{
  Json, Router,
  extract::{State, rejection::JsonRejection},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use ltss_core::event::StateChangedEvent;
use ltss_recorder::{Admission, PipelineState, Recorder, RecorderStats};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::debug;

use auth::{AuthConfig, Authenticated};


// ─── Application state ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
  pub recorder: Arc<Recorder>,
  /// `None` disables authentication.
  pub auth:     Option<Arc<AuthConfig>>,
}

// ─── Router ───────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/api/events", post(ingest))
    .route("/health", get(health))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum EventBatch {
  One(StateChangedEvent),
  Many(Vec<StateChangedEvent>),
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSummary {
  pub accepted:  usize,
  pub discarded: usize,
}

async fn ingest(
  State(state): State<AppState>,
  _auth: Authenticated,
  body: Result<Json<EventBatch>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestSummary>), ApiError> {
  let Json(batch) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
  let events = match batch {
    EventBatch::One(event) => vec![event],
    EventBatch::Many(events) => events,
  };

  // Events queued once draining has begun are never written.
  if matches!(
    state.recorder.state(),
    PipelineState::Draining | PipelineState::Stopped | PipelineState::Failed
  ) {
    return Err(ApiError::Unavailable { accepted: 0 });
  }

  let mut summary = IngestSummary { accepted: 0, discarded: 0 };
  for event in events {
    let admission = state
      .recorder
      .record(event)
      .map_err(|_| ApiError::Unavailable { accepted: summary.accepted })?;
    match admission {
      Admission::Enqueued => summary.accepted += 1,
      Admission::Discarded(reason) => {
        debug!(?reason, "event discarded");
        summary.discarded += 1;
      }
    }
  }
  Ok((StatusCode::ACCEPTED, Json(summary)))
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Health {
  pub state: PipelineState,
  pub stats: RecorderStats,
}

async fn health(State(state): State<AppState>) -> Response {
  let health = Health {
    state: state.recorder.state(),
    stats: state.recorder.stats(),
  };
  let status = if health.state == PipelineState::Ready {
    StatusCode::OK
  } else {
    StatusCode::SERVICE_UNAVAILABLE
  };
  (status, Json(health)).into_response()
}
