//! Sync Orchestrator (C6): runs one connection's full
//! fetch -> aggregate -> normalize -> resolve -> dedup -> persist pipeline
//! and drives the `pending -> in_progress -> {success|failed}` state
//! machine (spec §5).
//!
//! Grounded on `original_source/backend/app/services/sync_scheduler.py`'s
//! `sync_single_connection_async`/`_sync_connection` for the lifecycle, and
//! on `strategies::orchestrator::StrategyOrchestrator` for the
//! enum-dispatch shape that picks the right `ExchangeClient`.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::crypto::Cipher;
use crate::dedup::deduplicate;
use crate::exchanges;
use crate::leverage;
use crate::models::connection::{truncate_error, Exchange, ExchangeConnection, SyncStatus};
use crate::models::trade::CanonicalTrade;
use crate::normalize::{canonicalize_hyperliquid_symbol, canonicalize_symbol, normalize};
use crate::store::Store;

const MAX_ERROR_LEN: usize = 500;

pub struct SyncOrchestrator {
    store: Arc<dyn Store>,
    cipher: Arc<Cipher>,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub connection_id: uuid::Uuid,
    pub trades_inserted: usize,
    pub status: SyncStatus,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn Store>, cipher: Arc<Cipher>) -> Self {
        Self { store, cipher }
    }

    /// Run a single connection's sync job end to end. Advisory-locks the
    /// connection by flipping it to `in_progress` before doing any network
    /// I/O, so a concurrent scheduler tick sees it and skips.
    pub async fn sync_connection(&self, connection_id: uuid::Uuid) -> anyhow::Result<SyncOutcome> {
        let Some(conn) = self.store.get_connection(connection_id).await? else {
            anyhow::bail!("connection {connection_id} not found");
        };

        if conn.last_sync_status == SyncStatus::InProgress {
            warn!("connection {connection_id} already in progress, skipping");
            return Ok(SyncOutcome {
                connection_id,
                trades_inserted: 0,
                status: SyncStatus::InProgress,
            });
        }

        self.store
            .update_connection_status(connection_id, SyncStatus::InProgress, None, None)
            .await?;

        match self.run_pipeline(&conn).await {
            Ok(inserted) => {
                self.store
                    .update_connection_status(connection_id, SyncStatus::Success, Some(chrono::Utc::now()), None)
                    .await?;
                info!("synced connection {connection_id}: {inserted} new trades");
                Ok(SyncOutcome {
                    connection_id,
                    trades_inserted: inserted,
                    status: SyncStatus::Success,
                })
            }
            Err(e) => {
                let message = truncate_error(&e.to_string(), MAX_ERROR_LEN);
                error!("sync failed for connection {connection_id}: {message}");
                self.store
                    .update_connection_status(connection_id, SyncStatus::Failed, None, Some(message))
                    .await?;
                Ok(SyncOutcome {
                    connection_id,
                    trades_inserted: 0,
                    status: SyncStatus::Failed,
                })
            }
        }
    }

    async fn run_pipeline(&self, conn: &ExchangeConnection) -> anyhow::Result<usize> {
        let key = self.cipher.decrypt(&conn.credentials.key)?;
        let secret = if conn.credentials.secret.is_empty() {
            String::new()
        } else {
            self.cipher.decrypt(&conn.credentials.secret)?
        };
        let passphrase = conn
            .credentials
            .passphrase
            .as_ref()
            .map(|p| self.cipher.decrypt(p))
            .transpose()?;

        let client = exchanges::for_connection(conn, key, secret, passphrase);

        let logical_trades = client
            .fetch_trade_history(conn.last_sync_time)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let overrides = self.store.get_leverage_overrides(conn.user_id, conn.exchange).await?;
        let exchange_default = default_leverage_for(conn.exchange);

        let mut canonical_trades: Vec<CanonicalTrade> = Vec::with_capacity(logical_trades.len());
        for trade in &logical_trades {
            let symbol = match canonicalize(conn.exchange, &trade.raw_symbol) {
                Some(s) => s,
                None => continue,
            };
            let Some(mut normalized) = normalize(conn.user_id, conn.exchange, symbol, trade) else {
                continue;
            };
            leverage::resolve(&mut normalized, trade.leverage, &overrides, exchange_default);
            if normalized.satisfies_invariants() {
                canonical_trades.push(normalized);
            }
        }

        let existing_ids = self.store.list_existing_trade_ids(conn.user_id, conn.exchange).await?;
        let fresh_trades = deduplicate(canonical_trades, &existing_ids);

        self.store.upsert_trades(fresh_trades).await
    }
}

fn canonicalize(exchange: Exchange, raw_symbol: &str) -> Option<String> {
    match exchange {
        Exchange::Hyperliquid => Some(canonicalize_hyperliquid_symbol(raw_symbol)),
        _ => canonicalize_symbol(raw_symbol),
    }
}

fn default_leverage_for(exchange: Exchange) -> rust_decimal::Decimal {
    match exchange {
        Exchange::Hyperliquid => leverage::HYPERLIQUID_DEFAULT_LEVERAGE,
        _ => leverage::DEFAULT_LEVERAGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::connection::EncryptedCredentials;
    use crate::store::InMemoryStore;

    fn test_cipher() -> Cipher {
        use base64::Engine;
        Cipher::from_base64(&base64::engine::general_purpose::STANDARD.encode([3u8; 32])).unwrap()
    }

    #[tokio::test]
    async fn sync_skips_connection_already_in_progress() {
        let cipher = Arc::new(test_cipher());
        let memory_store = InMemoryStore::new();

        let mut conn = ExchangeConnection::new(
            uuid::Uuid::new_v4(),
            Exchange::Hyperliquid,
            EncryptedCredentials {
                key: cipher.encrypt("0x1234567890123456789012345678901234567890").unwrap(),
                secret: String::new(),
                passphrase: None,
            },
        );
        conn.last_sync_status = SyncStatus::InProgress;
        let id = conn.id;
        memory_store.insert_connection(conn).await;

        let store: Arc<dyn Store> = Arc::new(memory_store);
        let orchestrator = SyncOrchestrator::new(store, cipher);
        let outcome = orchestrator.sync_connection(id).await.unwrap();
        assert_eq!(outcome.status, SyncStatus::InProgress);
        assert_eq!(outcome.trades_inserted, 0);
    }
}
