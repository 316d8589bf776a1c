//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::{HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
  #[error("unauthorized")]
  Unauthorized,

  #[error("bad request: {0}")]
  BadRequest(String),

  /// The write pipeline has stopped or never started. `accepted` events of
  /// the batch were enqueued before that was noticed.
  #[error("recorder is not accepting events")]
  Unavailable { accepted: usize },
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match &self {
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = match &self {
      ApiError::Unavailable { accepted } => json!({ "error": self.to_string(), "accepted": accepted }),
      _ => json!({ "error": self.to_string() }),
    };
    let mut res = (status, Json(body)).into_response();
    if matches!(self, ApiError::Unauthorized) {
      res.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"ltss\""),
      );
    }
    res
  }
}
