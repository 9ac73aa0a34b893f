//! caselined — the caseline database pool daemon.
//!
//! Assembles the pool subsystems in one process:
//! - Secret store (file-backed, or seeded in memory for development)
//! - Credential cache
//! - MySQL connector and connection pool
//! - Pool maintenance (reaper + periodic prewarm)
//! - Admin API
//!
//! # Usage
//!
//! ```text
//! caselined run --config /etc/caseline/caselined.toml
//! caselined check-config --config /etc/caseline/caselined.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use caseline_db::{Database, MysqlConnector};
use caseline_secrets::{CredentialCache, FileSecretStore, MemorySecretStore, SecretStore, SecretValue};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use crate::config::{SecretsBackend, Settings};

#[derive(Parser)]
#[command(name = "caselined", about = "Caseline database pool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pool, its maintenance tasks and the admin API.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "/etc/caseline/caselined.toml")]
        config: PathBuf,
    },
    /// Parse and validate a configuration file, then print the effective
    /// configuration.
    CheckConfig {
        #[arg(long, default_value = "/etc/caseline/caselined.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,caselined=debug,caseline=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(Settings::from_file(&config)?).await,
        Command::CheckConfig { config } => {
            let settings = Settings::from_file(&config)?;
            print!("{}", settings.to_toml_string()?);
            Ok(())
        }
    }
}

fn secret_store(settings: &Settings) -> Arc<dyn SecretStore> {
    match settings.secrets.backend {
        SecretsBackend::File => {
            info!(directory = %settings.secrets.directory.display(), "using file secret store");
            Arc::new(FileSecretStore::new(&settings.secrets.directory))
        }
        SecretsBackend::Memory => {
            let store = MemorySecretStore::new();
            for (name, fields) in &settings.secrets.seed {
                store.insert(
                    name.clone(),
                    SecretValue::from_pairs(fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
                );
            }
            tracing::warn!(
                secrets = settings.secrets.seed.len(),
                "using in-memory secret store seeded from config; not for production"
            );
            Arc::new(store)
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!(
        db = %format!("{}:{}/{}", settings.database.host, settings.database.port, settings.database.name),
        secret = %settings.credentials.secret_name,
        "caselined starting"
    );

    // ── Initialize subsystems ──────────────────────────────────

    let cache = Arc::new(
        CredentialCache::new(secret_store(&settings))
            .with_degradation_window(settings.secrets.degradation_window),
    );
    let connector = Arc::new(MysqlConnector::new(
        settings.database.connect_timeout,
        settings.database.io_timeout,
    ));
    let db = Database::init(settings.database_config(), cache, connector);

    // A failed initial prewarm is not fatal: the pool opens connections on
    // demand and the periodic prewarm retries.
    let report = db.prewarm(None).await;
    match &report.error {
        None => info!(created = report.created, depth = report.depth, "initial prewarm complete"),
        Some(error) => tracing::warn!(
            created = report.created,
            error = %error,
            "initial prewarm incomplete"
        ),
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let maintenance = db.maintenance();
    let maintenance_handle = tokio::spawn(async move {
        maintenance.run(shutdown_rx).await;
    });

    // ── Start admin server ─────────────────────────────────────

    let router = caseline_admin::build_router(db.clone());
    let addr = settings.admin.listen;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding admin listener on {addr}"))?;
    info!(%addr, "admin API listening");

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Wait for background tasks.
    let _ = maintenance_handle.await;
    db.shutdown().await;

    info!("caselined stopped");
    Ok(())
}
