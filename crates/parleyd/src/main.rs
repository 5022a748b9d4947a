//! # parleyd
//!
//! Parley server binary: wires settings, logging, storage, the sync engine
//! and the HTTP/WebSocket server together.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use parley_core::UserId;
use parley_logging::Format;
use parley_server::config::sync_config;
use parley_server::{ParleyServer, ServerConfig, TokenAuthority};
use parley_settings::{LogFormat, ParleySettings, StorageSettings};
use parley_store::{ChatStore, ConnectionConfig, SqliteStore};
use parley_sync::SyncEngine;

/// Parley chat server.
#[derive(Parser, Debug)]
#[command(name = "parleyd", about = "Parley chat server")]
struct Cli {
    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Database file, overriding settings. `:memory:` keeps nothing.
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server until Ctrl-C.
    Serve {
        /// Host to bind, overriding settings.
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (0 for auto-assign), overriding settings.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create a user and print its id and a token.
    AddUser {
        /// Display name.
        #[arg(long)]
        name: String,
        /// Avatar URL.
        #[arg(long)]
        avatar: Option<String>,
    },
    /// Print a fresh token for an existing user.
    IssueToken {
        /// User id.
        #[arg(long)]
        user: String,
    },
}

fn load_settings(cli: &Cli) -> Result<ParleySettings> {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(parley_settings::settings_path);
    let mut settings = parley_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(db) = &cli.db {
        settings.storage.db_path = Some(db.clone());
    }
    Ok(settings)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn open_store(storage: &StorageSettings) -> Result<SqliteStore> {
    let path = match storage.db_path.as_deref() {
        Some(path) if !storage.is_in_memory() => path,
        _ => {
            tracing::warn!("using an in-memory database; nothing will persist");
            return SqliteStore::in_memory().context("Failed to open in-memory database");
        }
    };
    ensure_parent_dir(Path::new(path))?;
    let config = ConnectionConfig {
        pool_size: storage.pool_size,
        busy_timeout_ms: storage.busy_timeout_ms,
    };
    SqliteStore::open(path, &config).with_context(|| format!("Failed to open database at {path}"))
}

fn log_format(format: LogFormat) -> Format {
    match format {
        LogFormat::Compact => Format::Compact,
        LogFormat::Json => Format::Json,
    }
}

async fn serve(settings: ParleySettings, host: Option<String>, port: Option<u16>) -> Result<()> {
    let store: Arc<dyn ChatStore> = Arc::new(open_store(&settings.storage)?);
    let engine = Arc::new(SyncEngine::new(store, sync_config(&settings)));

    let mut config = ServerConfig::from_settings(&settings.server);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let auth = TokenAuthority::from_settings(&settings.auth);
    if settings.auth.token_secret == parley_settings::AuthSettings::default().token_secret {
        tracing::warn!("token secret is the default; set PARLEY_TOKEN_SECRET before exposing the server");
    }

    let mut server = ParleyServer::new(config, engine, auth);
    match parley_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "metrics recorder not installed"),
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Parley listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    server.shutdown().drain().await;
    let _ = handle.await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn add_user(settings: &ParleySettings, name: &str, avatar: Option<&str>) -> Result<()> {
    let store = open_store(&settings.storage)?;
    let user = store
        .create_user(name, avatar)
        .await
        .context("Failed to create user")?;
    let token = TokenAuthority::from_settings(&settings.auth)
        .issue(&user.id)
        .context("Failed to issue token")?;
    println!("id:    {}", user.id);
    println!("token: {token}");
    Ok(())
}

async fn issue_token(settings: &ParleySettings, user: &str) -> Result<()> {
    let store = open_store(&settings.storage)?;
    let id = UserId::from(user);
    if store.user(&id).await.context("Failed to look up user")?.is_none() {
        bail!("no user with id {user}");
    }
    let token = TokenAuthority::from_settings(&settings.auth)
        .issue(&id)
        .context("Failed to issue token")?;
    println!("{token}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    parley_logging::init_subscriber(&settings.logging.level, log_format(settings.logging.format));

    match cli.command {
        Command::Serve { host, port } => serve(settings, host, port).await,
        Command::AddUser { name, avatar } => add_user(&settings, &name, avatar.as_deref()).await,
        Command::IssueToken { user } => issue_token(&settings, &user).await,
    }
}
