//! # courier
//!
//! Server binary: loads settings, sets up logging and metrics, and serves
//! the HTTP + WebSocket API until interrupted.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use courier_core::AccountId;
use courier_server::{CourierServer, JwtIdentityVerifier, ServerConfig, SqliteMessageStore};
use courier_settings::CourierSettings;
use tracing::{info, warn};

/// How long in-flight connections get to finish after an interrupt.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Courier messaging server.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Courier messaging server")]
struct Cli {
    /// Settings file (defaults to `~/.courier/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP and WebSocket API.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,
        /// Port to bind, `0` for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,
        /// Path to the `SQLite` database (overrides settings).
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Skip the Prometheus recorder and `/metrics`.
        #[arg(long)]
        no_metrics: bool,
    },
    /// Print an identity token for `account`, signed with the configured secret.
    IssueToken {
        /// Account the token asserts.
        #[arg(long)]
        account: String,
        /// Lifetime in hours.
        #[arg(long, default_value = "24")]
        ttl_hours: i64,
    },
}

fn load_settings(path: Option<&Path>) -> Result<CourierSettings> {
    let path = path.map_or_else(courier_settings::loader::settings_path, Path::to_path_buf);
    courier_settings::loader::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

fn identity_secret(settings: &CourierSettings) -> Result<&str> {
    match settings.server.identity_secret.as_deref() {
        Some(secret) if !secret.is_empty() => Ok(secret),
        _ => bail!("server.identitySecret is not set (or COURIER_IDENTITY_SECRET)"),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

async fn serve(
    settings: &CourierSettings,
    host: Option<String>,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    metrics: bool,
) -> Result<()> {
    let secret = identity_secret(settings)?;

    let mut config = ServerConfig::from_settings(settings);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let db_path = db_path.unwrap_or_else(|| PathBuf::from(&settings.server.database_path));
    ensure_parent_dir(&db_path)?;
    let store = SqliteMessageStore::open(&db_path.to_string_lossy())
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let mut server = CourierServer::new(
        config,
        Arc::new(store),
        Arc::new(JwtIdentityVerifier::new(secret.as_bytes())),
    );
    if metrics {
        match courier_server::metrics::install_recorder() {
            Ok(handle) => server = server.with_metrics(handle),
            Err(err) => warn!(error = %err, "metrics recorder unavailable, /metrics disabled"),
        }
    }

    let handle = server.listen().await.context("Failed to bind listener")?;
    info!(addr = %handle.local_addr(), db = %db_path.display(), "courier listening");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    info!("interrupt received, shutting down");
    handle.shutdown(Some(SHUTDOWN_GRACE)).await;
    info!("shutdown complete");
    Ok(())
}

fn issue_token(settings: &CourierSettings, account: &str, ttl_hours: i64) -> Result<String> {
    if account.trim().is_empty() {
        bail!("account must not be empty");
    }
    let ttl = TimeDelta::try_hours(ttl_hours)
        .filter(|ttl| *ttl > TimeDelta::zero())
        .context("ttl-hours must be positive")?;
    let verifier = JwtIdentityVerifier::new(identity_secret(settings)?.as_bytes());
    verifier
        .issue(&AccountId::from(account), Utc::now() + ttl)
        .context("Failed to sign token")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if courier_settings::init_settings(load_settings(cli.settings.as_deref())?).is_err() {
        bail!("settings were initialized twice");
    }
    let settings = courier_settings::get_settings();
    courier_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    match cli.command {
        Command::Serve {
            host,
            port,
            db_path,
            no_metrics,
        } => serve(settings, host, port, db_path, !no_metrics).await,
        Command::IssueToken { account, ttl_hours } => {
            let token = issue_token(settings, &account, ttl_hours)?;
            println!("{token}");
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
