//! Optional HTTP Basic auth for the ingestion endpoint.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
  extract::FromRequestParts,
  http::{HeaderMap, header, request::Parts},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};

use crate::{AppState, error::ApiError};

/// Credentials accepted by this server instance.
#[derive(Clone)]
pub struct AuthConfig {
  pub username:      String,
  /// PHC string produced by argon2.
  pub password_hash: String,
}

/// Present in a handler means the request was authenticated, or auth is off.
pub struct Authenticated;

pub fn verify_auth(headers: &HeaderMap, config: &AuthConfig) -> Result<(), ApiError> {
  let encoded = headers
    .get(header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Basic "))
    .ok_or(ApiError::Unauthorized)?;

  let decoded = B64.decode(encoded).map_err(|_| ApiError::Unauthorized)?;
  let creds = std::str::from_utf8(&decoded).map_err(|_| ApiError::Unauthorized)?;
  let (username, password) = creds.split_once(':').ok_or(ApiError::Unauthorized)?;

  if username != config.username {
    return Err(ApiError::Unauthorized);
  }

  let parsed_hash = PasswordHash::new(&config.password_hash).map_err(|_| ApiError::Unauthorized)?;
  Argon2::default()
    .verify_password(password.as_bytes(), &parsed_hash)
    .map_err(|_| ApiError::Unauthorized)
}

impl FromRequestParts<AppState> for Authenticated {
  type Rejection = ApiError;

  async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
    if let Some(auth) = &state.auth {
      verify_auth(&parts.headers, auth)?;
    }
    Ok(Authenticated)
  }
}

#[cfg(test)]
mod tests {
  use argon2::{PasswordHasher, password_hash::SaltString};
  use axum::http::HeaderValue;
  use rand_core::OsRng;

  use super::*;

  fn config(password: &str) -> AuthConfig {
    let salt = SaltString::generate(&mut OsRng);
    AuthConfig {
      username:      "hass".to_string(),
      password_hash: Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string(),
    }
  }

  fn headers(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
    headers
  }

  fn basic(user: &str, pass: &str) -> String { format!("Basic {}", B64.encode(format!("{user}:{pass}"))) }

  #[test]
  fn accepts_matching_credentials() {
    assert!(verify_auth(&headers(&basic("hass", "secret")), &config("secret")).is_ok());
  }

  #[test]
  fn rejects_wrong_password_and_user() {
    let config = config("secret");
    assert!(matches!(verify_auth(&headers(&basic("hass", "wrong")), &config), Err(ApiError::Unauthorized)));
    assert!(matches!(verify_auth(&headers(&basic("root", "secret")), &config), Err(ApiError::Unauthorized)));
  }

  #[test]
  fn rejects_malformed_headers() {
    let config = config("secret");
    assert!(verify_auth(&HeaderMap::new(), &config).is_err());
    assert!(verify_auth(&headers("Basic !!!not-base64!!!"), &config).is_err());
    assert!(verify_auth(&headers("Bearer abc"), &config).is_err());
  }
}
