#![allow(dead_code)]

mod config;
mod crypto;
mod dedup;
mod error;
mod exchanges;
mod leverage;
mod models;
mod normalize;
mod orchestrator;
mod scheduler;
mod store;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::config::Config;
use crate::crypto::Cipher;
use crate::models::connection::{EncryptedCredentials, Exchange, ExchangeConnection};
use crate::orchestrator::SyncOrchestrator;
use crate::scheduler::Scheduler;
use crate::store::{InMemoryStore, Store};

#[derive(Parser)]
#[command(name = "tradesync", version, about = "Multi-exchange trade-sync and aggregation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and run sync passes forever.
    Run,
    /// Register a new exchange connection so `sync`/`resync` have something
    /// to act on. Prints the generated connection id.
    Register {
        #[arg(long)]
        user_id: Option<uuid::Uuid>,
        #[arg(long)]
        exchange: Exchange,
        #[arg(long)]
        key: String,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Run a single sync pass for one connection, then exit.
    Sync {
        #[arg(long)]
        connection_id: uuid::Uuid,
    },
    /// Force a resync, ignoring the connection's `last_sync_time` cursor.
    Resync {
        #[arg(long)]
        connection_id: uuid::Uuid,
    },
    /// Validate a set of exchange credentials without persisting anything.
    Validate {
        #[arg(long)]
        exchange: Exchange,
        #[arg(long)]
        key: String,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        passphrase: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("================================================");
    info!("  tradesync — multi-exchange trade journal sync");
    info!("================================================");

    let config = Config::load_or_default();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate {
            exchange,
            key,
            secret,
            passphrase,
        } => run_validate(exchange, key, secret, passphrase).await,
        Command::Register {
            user_id,
            exchange,
            key,
            secret,
            passphrase,
        } => {
            config.validate()?;
            run_register(user_id, exchange, key, secret, passphrase).await
        }
        Command::Sync { connection_id } => {
            config.validate()?;
            run_one_sync(connection_id).await
        }
        Command::Resync { connection_id } => {
            config.validate()?;
            run_one_resync(connection_id).await
        }
        Command::Run => {
            config.validate()?;
            run_forever(config).await
        }
    }
}

async fn run_validate(
    exchange: Exchange,
    key: String,
    secret: Option<String>,
    passphrase: Option<String>,
) -> anyhow::Result<()> {
    let conn = ExchangeConnection::new(
        uuid::Uuid::nil(),
        exchange,
        EncryptedCredentials {
            key: String::new(),
            secret: String::new(),
            passphrase: None,
        },
    );
    let client = exchanges::for_connection(&conn, key, secret.unwrap_or_default(), passphrase);
    match client.validate_credentials().await {
        Ok(true) => {
            info!("credentials are valid");
            Ok(())
        }
        Ok(false) => {
            error!("credentials rejected by exchange");
            std::process::exit(1);
        }
        Err(e) => {
            error!("validation failed: {e}");
            if let Some(remediation) = e.remediation() {
                info!("remediation: {remediation}");
            }
            std::process::exit(1);
        }
    }
}

/// Path to the on-disk connection registry `register`/`sync`/`resync` share
/// across process invocations, since `InMemoryStore` itself doesn't survive
/// past one process. Overridable for tests/deployments with multiple
/// independent registries running side by side.
const CONNECTIONS_FILE_ENV: &str = "TRADESYNC_CONNECTIONS_FILE";
const DEFAULT_CONNECTIONS_FILE: &str = "tradesync_connections.json";

fn connections_file_path() -> std::path::PathBuf {
    std::env::var(CONNECTIONS_FILE_ENV)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from(DEFAULT_CONNECTIONS_FILE))
}

fn load_persisted_connections() -> Vec<ExchangeConnection> {
    load_connections_from(&connections_file_path())
}

fn load_connections_from(path: &std::path::Path) -> Vec<ExchangeConnection> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str(&contents).unwrap_or_else(|e| {
        error!("failed to parse {}: {e}, starting with no connections", path.display());
        Vec::new()
    })
}

async fn persist_connections(store: &Arc<dyn Store>) -> anyhow::Result<()> {
    let connections = store.list_connections().await?;
    let json = serde_json::to_string_pretty(&connections)?;
    std::fs::write(connections_file_path(), json)?;
    Ok(())
}

/// Build the demo store + orchestrator pair the CLI subcommands run
/// against, seeded from whatever `register` has previously persisted to
/// `connections_file_path()`. A production deployment wires a real `Store`
/// (Supabase or Postgres-backed) in its place; the interface is identical
/// either way.
async fn build_orchestrator() -> anyhow::Result<(Arc<dyn Store>, Arc<SyncOrchestrator>)> {
    let memory_store = InMemoryStore::new();
    for conn in load_persisted_connections() {
        memory_store.insert_connection(conn).await;
    }

    let store: Arc<dyn Store> = Arc::new(memory_store);
    let cipher = Arc::new(Cipher::from_env()?);
    let orchestrator = Arc::new(SyncOrchestrator::new(store.clone(), cipher));
    Ok((store, orchestrator))
}

async fn run_register(
    user_id: Option<uuid::Uuid>,
    exchange: Exchange,
    key: String,
    secret: Option<String>,
    passphrase: Option<String>,
) -> anyhow::Result<()> {
    let cipher = Cipher::from_env()?;
    let credentials = EncryptedCredentials {
        key: cipher.encrypt(&key)?,
        secret: secret.map(|s| cipher.encrypt(&s)).transpose()?.unwrap_or_default(),
        passphrase: passphrase.map(|p| cipher.encrypt(&p)).transpose()?,
    };

    let user_id = user_id.unwrap_or_else(uuid::Uuid::new_v4);
    let conn = ExchangeConnection::new(user_id, exchange, credentials);
    let connection_id = conn.id;

    let (store, _orchestrator) = build_orchestrator().await?;
    store.upsert_connection(conn).await?;
    persist_connections(&store).await?;

    info!("registered connection {connection_id} for user {user_id} on {exchange}");
    info!("run `tradesync sync --connection-id {connection_id}` to sync it");
    Ok(())
}

async fn run_one_sync(connection_id: uuid::Uuid) -> anyhow::Result<()> {
    let (store, orchestrator) = build_orchestrator().await?;
    let outcome = orchestrator.sync_connection(connection_id).await?;
    persist_connections(&store).await?;
    info!("sync finished: status={:?} new_trades={}", outcome.status, outcome.trades_inserted);
    Ok(())
}

async fn run_one_resync(connection_id: uuid::Uuid) -> anyhow::Result<()> {
    let (store, orchestrator) = build_orchestrator().await?;
    // A resync clears the cursor so the next fetch pulls full history again.
    store
        .update_connection_status(connection_id, crate::models::connection::SyncStatus::Pending, None, None)
        .await?;
    let outcome = orchestrator.sync_connection(connection_id).await?;
    persist_connections(&store).await?;
    info!("resync finished: status={:?} new_trades={}", outcome.status, outcome.trades_inserted);
    Ok(())
}

async fn run_forever(config: Config) -> anyhow::Result<()> {
    let (store, orchestrator) = build_orchestrator().await?;
    let scheduler = Scheduler::new(orchestrator, store, config.sync.clone());

    info!(
        "scheduler starting: every {}h, up to {} concurrent connections",
        config.sync.interval_hours, config.sync.max_concurrent_connections
    );

    tokio::select! {
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tradesync_test_{tag}_{}.json", std::process::id()))
    }

    #[test]
    fn load_connections_from_missing_file_is_empty() {
        let path = scratch_path("missing");
        assert!(load_connections_from(&path).is_empty());
    }

    #[test]
    fn load_connections_from_round_trips_what_was_written() {
        let path = scratch_path("roundtrip");
        let conn = ExchangeConnection::new(
            uuid::Uuid::new_v4(),
            Exchange::Bybit,
            EncryptedCredentials {
                key: "k".into(),
                secret: "s".into(),
                passphrase: None,
            },
        );

        std::fs::write(&path, serde_json::to_string(&vec![conn.clone()]).unwrap()).unwrap();
        let loaded = load_connections_from(&path);
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, conn.id);
        assert_eq!(loaded[0].exchange, Exchange::Bybit);
    }

    #[test]
    fn load_connections_from_malformed_file_is_empty_not_a_panic() {
        let path = scratch_path("malformed");
        std::fs::write(&path, "not json").unwrap();
        let loaded = load_connections_from(&path);
        std::fs::remove_file(&path).ok();

        assert!(loaded.is_empty());
    }

    #[test]
    fn default_connections_file_path_is_relative_cwd_file() {
        assert!(std::env::var(CONNECTIONS_FILE_ENV).is_err());
        assert_eq!(connections_file_path(), std::path::PathBuf::from(DEFAULT_CONNECTIONS_FILE));
    }
}
