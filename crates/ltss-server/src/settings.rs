//! Runtime configuration, read from a TOML file and `LTSS_*` environment
//! variables.

use std::{path::Path, time::Duration};

use config::{ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};
use ltss_core::filter::{EntityFilter, FilterConfig};
use ltss_recorder::RetryPolicy;
use ltss_store_postgres::{DEFAULT_CHUNK_TIME_INTERVAL, PostgresConfig};
use serde::Deserialize;

use crate::auth::AuthConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// PostgreSQL connection URI.
  pub db_url:                  String,
  #[serde(default = "default_host")]
  pub host:                    String,
  #[serde(default = "default_port")]
  pub port:                    u16,
  /// Hypertable chunk span in microseconds.
  #[serde(default = "default_chunk_time_interval")]
  pub chunk_time_interval:     i64,
  #[serde(default)]
  pub include:                 FilterConfig,
  #[serde(default)]
  pub exclude:                 FilterConfig,
  #[serde(default = "default_connect_retry_wait_secs")]
  pub connect_retry_wait_secs: u64,
  #[serde(default = "default_max_attempts")]
  pub max_attempts:            u32,
  pub auth_username:           Option<String>,
  /// argon2 PHC string, e.g. `$argon2id$v=19$…`
  pub auth_password_hash:      Option<String>,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8123 }
fn default_chunk_time_interval() -> i64 { DEFAULT_CHUNK_TIME_INTERVAL }
fn default_connect_retry_wait_secs() -> u64 { 3 }
fn default_max_attempts() -> u32 { 10 }

impl ServerConfig {
  /// Read `path` if it exists, then apply `LTSS_*` overrides.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    Self::from_builder(config::Config::builder().add_source(File::from(path).required(false)))
  }

  pub(crate) fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
    builder
      .add_source(Environment::with_prefix("LTSS"))
      .build()?
      .try_deserialize()
  }

  pub fn postgres(&self) -> PostgresConfig {
    let mut config = PostgresConfig::new(&self.db_url);
    config.chunk_time_interval = self.chunk_time_interval;
    config
  }

  pub fn filter(&self) -> EntityFilter { EntityFilter::new(&self.include, &self.exclude) }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts,
      wait:         Duration::from_secs(self.connect_retry_wait_secs),
    }
  }

  /// Basic auth is enforced only when both halves are configured.
  pub fn auth(&self) -> Option<AuthConfig> {
    match (&self.auth_username, &self.auth_password_hash) {
      (Some(username), Some(password_hash)) => Some(AuthConfig {
        username:      username.clone(),
        password_hash: password_hash.clone(),
      }),
      _ => None,
    }
  }
}
