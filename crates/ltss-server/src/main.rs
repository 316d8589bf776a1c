//! ltss server binary.
//!
//! Reads `ltss.toml` (or the path given with `--config`) plus `LTSS_*`
//! environment overrides, brings the PostgreSQL schema up to date, and
//! accepts state-change events over HTTP.
//!
//! # Password hash generation
//!
//! To generate the argon2 PHC string for `auth_password_hash`:
//!
//! ```text
//! cargo run -p ltss-server --bin ltss -- --hash-password
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use clap::Parser;
use ltss_recorder::Recorder;
use ltss_server::{AppState, ServerConfig};
use ltss_store_postgres::PostgresConnector;
use rand_core::OsRng;
use tokio::net::TcpListener;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Long time state storage for Home Assistant")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "ltss.toml")]
  config: PathBuf,

  /// Print the argon2 hash for a password entered on stdin and exit.
  #[arg(long)]
  hash_password: bool,

  /// Bring the database schema up to date, list the applied steps and exit.
  #[arg(long)]
  migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  if cli.hash_password {
    let password = read_password()?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
      .to_string();
    println!("{hash}");
    return Ok(());
  }

  let server_cfg = ServerConfig::load(&cli.config)
    .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;

  if cli.migrate_only {
    let pg = server_cfg.postgres();
    let bootstrapped = tokio::task::spawn_blocking(move || ltss_store_postgres::bootstrap(&pg))
      .await
      .context("bootstrap task panicked")?
      .context("failed to bootstrap the database")?;
    if bootstrapped.migrations.is_empty() {
      println!("schema is up to date");
    }
    for step in &bootstrapped.migrations.applied {
      println!("{step}");
    }
    return Ok(());
  }

  let recorder = Recorder::spawn(
    PostgresConnector::new(server_cfg.postgres()),
    server_cfg.filter(),
    server_cfg.retry_policy(),
  )
  .context("failed to start the recorder")?;
  let recorder = Arc::new(recorder);

  if !recorder.ready().await {
    anyhow::bail!("could not connect to {}", redact(&server_cfg.db_url));
  }

  let state = AppState {
    recorder: Arc::clone(&recorder),
    auth:     server_cfg.auth().map(Arc::new),
  };
  if state.auth.is_none() {
    info!("authentication is disabled");
  }

  let app = ltss_server::router(state);
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  info!("draining recorder queue");
  tokio::task::spawn_blocking(move || recorder.shutdown())
    .await
    .context("recorder shutdown panicked")?;

  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c().await.ok();
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut sig) => {
        sig.recv().await;
      }
      Err(_) => std::future::pending::<()>().await,
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    () = ctrl_c => {},
    () = terminate => {},
  }
}

/// Drop the password from a connection URI before logging it.
fn redact(url: &str) -> String {
  let Some((scheme, rest)) = url.split_once("://") else {
    return url.to_string();
  };
  match rest.split_once('@') {
    Some((userinfo, host)) => {
      let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
      format!("{scheme}://{user}@{host}")
    }
    None => url.to_string(),
  }
}

/// Read a password from stdin.
fn read_password() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  print!("Password: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  io::stdin().lock().read_line(&mut line)?;
  Ok(line.trim_end_matches(['\n', '\r']).to_string())
}
