//! Persistence interface (spec §6) and an in-process implementation.
//!
//! The real store (Supabase/Postgres-backed, per spec §1) is a named
//! external collaborator and out of scope. `InMemoryStore` lets the
//! orchestrator and scheduler run and be tested end-to-end without one —
//! grounded on the teacher's own `Arc<RwLock<...>>`-backed in-process
//! state (`risk::position_manager::PositionManager`).

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::connection::{Exchange, ExchangeConnection, SyncStatus};
use crate::models::trade::CanonicalTrade;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_connection(&self, id: uuid::Uuid) -> anyhow::Result<Option<ExchangeConnection>>;
    async fn list_connections(&self) -> anyhow::Result<Vec<ExchangeConnection>>;
    /// Insert or replace a connection by id. The CLI's `register` subcommand
    /// is the only caller outside tests — it's how a connection gets into
    /// the store at all, since `Store` otherwise only exposes mutation
    /// through `update_connection_status`/`upsert_trades`.
    async fn upsert_connection(&self, conn: ExchangeConnection) -> anyhow::Result<()>;
    async fn update_connection_status(
        &self,
        id: uuid::Uuid,
        status: SyncStatus,
        last_sync_time: Option<chrono::DateTime<chrono::Utc>>,
        last_error: Option<String>,
    ) -> anyhow::Result<()>;
    async fn list_existing_trade_ids(
        &self,
        user_id: uuid::Uuid,
        exchange: Exchange,
    ) -> anyhow::Result<HashSet<String>>;
    async fn upsert_trades(&self, trades: Vec<CanonicalTrade>) -> anyhow::Result<usize>;
    async fn get_leverage_overrides(
        &self,
        user_id: uuid::Uuid,
        exchange: Exchange,
    ) -> anyhow::Result<HashMap<String, Decimal>>;
}

#[derive(Default)]
struct InMemoryState {
    connections: HashMap<uuid::Uuid, ExchangeConnection>,
    // keyed by (user_id, exchange, exchange_trade_id)
    trades: HashMap<(uuid::Uuid, String, String), CanonicalTrade>,
    leverage_overrides: HashMap<(uuid::Uuid, String), HashMap<String, Decimal>>,
}

pub struct InMemoryStore {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(InMemoryState::default())),
        }
    }

    pub async fn insert_connection(&self, conn: ExchangeConnection) {
        self.state.write().await.connections.insert(conn.id, conn);
    }

    pub async fn set_leverage_overrides(
        &self,
        user_id: uuid::Uuid,
        exchange: Exchange,
        overrides: HashMap<String, Decimal>,
    ) {
        self.state
            .write()
            .await
            .leverage_overrides
            .insert((user_id, exchange.to_string()), overrides);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_connection(&self, id: uuid::Uuid) -> anyhow::Result<Option<ExchangeConnection>> {
        Ok(self.state.read().await.connections.get(&id).cloned())
    }

    async fn list_connections(&self) -> anyhow::Result<Vec<ExchangeConnection>> {
        Ok(self.state.read().await.connections.values().cloned().collect())
    }

    async fn upsert_connection(&self, conn: ExchangeConnection) -> anyhow::Result<()> {
        self.state.write().await.connections.insert(conn.id, conn);
        Ok(())
    }

    async fn update_connection_status(
        &self,
        id: uuid::Uuid,
        status: SyncStatus,
        last_sync_time: Option<chrono::DateTime<chrono::Utc>>,
        last_error: Option<String>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("connection {id} not found"))?;
        conn.last_sync_status = status;
        if let Some(t) = last_sync_time {
            conn.last_sync_time = Some(t);
        }
        conn.last_error = last_error;
        Ok(())
    }

    async fn list_existing_trade_ids(
        &self,
        user_id: uuid::Uuid,
        exchange: Exchange,
    ) -> anyhow::Result<HashSet<String>> {
        let state = self.state.read().await;
        Ok(state
            .trades
            .keys()
            .filter(|(uid, ex, _)| *uid == user_id && *ex == exchange.to_string())
            .map(|(_, _, tid)| tid.clone())
            .collect())
    }

    async fn upsert_trades(&self, trades: Vec<CanonicalTrade>) -> anyhow::Result<usize> {
        let mut state = self.state.write().await;
        let mut inserted = 0;
        for trade in trades {
            let key = (
                trade.user_id,
                trade.exchange.to_string(),
                trade.exchange_trade_id.clone(),
            );
            if !state.trades.contains_key(&key) {
                inserted += 1;
            }
            state.trades.insert(key, trade);
        }
        Ok(inserted)
    }

    async fn get_leverage_overrides(
        &self,
        user_id: uuid::Uuid,
        exchange: Exchange,
    ) -> anyhow::Result<HashMap<String, Decimal>> {
        let state = self.state.read().await;
        Ok(state
            .leverage_overrides
            .get(&(user_id, exchange.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::connection::EncryptedCredentials;
    use crate::models::trade::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_trade(user_id: uuid::Uuid, id: &str) -> CanonicalTrade {
        CanonicalTrade {
            user_id,
            exchange: Exchange::Binance,
            symbol: "BTC-USDT".into(),
            side: Side::Buy,
            entry_price: dec!(1),
            exit_price: dec!(1),
            quantity: dec!(1),
            leverage: dec!(1),
            fees: dec!(0),
            pnl_usd: dec!(0),
            pnl_percent: dec!(0),
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            exchange_trade_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_trade_id() {
        let store = InMemoryStore::new();
        let user_id = uuid::Uuid::new_v4();
        let inserted_first = store.upsert_trades(vec![sample_trade(user_id, "X")]).await.unwrap();
        let inserted_second = store.upsert_trades(vec![sample_trade(user_id, "X")]).await.unwrap();
        assert_eq!(inserted_first, 1);
        assert_eq!(inserted_second, 0);

        let ids = store.list_existing_trade_ids(user_id, Exchange::Binance).await.unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn connection_status_updates_persist() {
        let store = InMemoryStore::new();
        let conn = ExchangeConnection::new(
            uuid::Uuid::new_v4(),
            Exchange::Bybit,
            EncryptedCredentials {
                key: "k".into(),
                secret: "s".into(),
                passphrase: None,
            },
        );
        let id = conn.id;
        store.insert_connection(conn).await;

        store
            .update_connection_status(id, SyncStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();

        let reloaded = store.get_connection(id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_sync_status, SyncStatus::Failed);
        assert_eq!(reloaded.last_error.as_deref(), Some("boom"));
    }
}
