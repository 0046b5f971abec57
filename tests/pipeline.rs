//! End-to-end test of the fetch -> aggregate -> normalize -> resolve ->
//! dedup -> persist pipeline against the in-memory store, exercising the
//! orchestrator the same way the CLI's `sync`/`resync` subcommands do.

use std::sync::Arc;

use base64::Engine;
use rust_decimal_macros::dec;

use tradesync::crypto::Cipher;
use tradesync::models::connection::{EncryptedCredentials, Exchange, ExchangeConnection, SyncStatus};
use tradesync::orchestrator::SyncOrchestrator;
use tradesync::store::{InMemoryStore, Store};

fn test_cipher() -> Cipher {
    Cipher::from_base64(&base64::engine::general_purpose::STANDARD.encode([9u8; 32])).unwrap()
}

/// A connection with an invalid Hyperliquid wallet address fails validation
/// during the pipeline and the orchestrator records it as `failed`, not a
/// panic or a silently-abandoned `in_progress` connection.
#[tokio::test]
async fn sync_connection_with_bad_wallet_records_failure() {
    let cipher = Arc::new(test_cipher());
    let memory_store = InMemoryStore::new();

    let conn = ExchangeConnection::new(
        uuid::Uuid::new_v4(),
        Exchange::Hyperliquid,
        EncryptedCredentials {
            key: cipher.encrypt("not-a-wallet-address").unwrap(),
            secret: String::new(),
            passphrase: None,
        },
    );
    let id = conn.id;
    memory_store.insert_connection(conn).await;

    let store: Arc<dyn Store> = Arc::new(memory_store);
    let orchestrator = SyncOrchestrator::new(store.clone(), cipher);

    let outcome = orchestrator.sync_connection(id).await.unwrap();
    assert_eq!(outcome.status, SyncStatus::Failed);
    assert_eq!(outcome.trades_inserted, 0);

    let reloaded = store.get_connection(id).await.unwrap().unwrap();
    assert_eq!(reloaded.last_sync_status, SyncStatus::Failed);
    assert!(reloaded.last_error.is_some());
}

/// Running the same sync twice against a store that already has the
/// connection's trades persisted should not re-increment the store twice,
/// the second run only inherits whatever the first one already wrote.
#[tokio::test]
async fn second_sync_of_same_connection_is_idempotent_on_existing_trades() {
    let cipher = Arc::new(test_cipher());
    let memory_store = InMemoryStore::new();
    let user_id = uuid::Uuid::new_v4();

    let conn = ExchangeConnection::new(
        user_id,
        Exchange::Bybit,
        EncryptedCredentials {
            key: cipher.encrypt("test-key").unwrap(),
            secret: cipher.encrypt("test-secret").unwrap(),
            passphrase: None,
        },
    );
    let id = conn.id;
    memory_store.insert_connection(conn).await;

    // Seed the store as if a prior sync already landed this trade.
    let pre_existing = tradesync::models::trade::CanonicalTrade {
        user_id,
        exchange: Exchange::Bybit,
        symbol: "BTC-USDT".into(),
        side: tradesync::models::trade::Side::Buy,
        entry_price: dec!(50000),
        exit_price: dec!(51000),
        quantity: dec!(0.1),
        leverage: dec!(5),
        fees: dec!(2),
        pnl_usd: dec!(100),
        pnl_percent: dec!(20),
        entry_time: chrono::Utc::now(),
        exit_time: chrono::Utc::now(),
        exchange_trade_id: "already-there".into(),
    };
    memory_store.upsert_trades(vec![pre_existing]).await.unwrap();

    let ids_before = memory_store.list_existing_trade_ids(user_id, Exchange::Bybit).await.unwrap();
    assert_eq!(ids_before.len(), 1);

    let store: Arc<dyn Store> = Arc::new(memory_store);
    let orchestrator = SyncOrchestrator::new(store.clone(), cipher);

    // Bybit's network call will fail in this offline test environment, so
    // the run ends in `Failed`; the point is that the pre-existing trade
    // survives untouched and the connection doesn't panic mid-pipeline.
    let outcome = orchestrator.sync_connection(id).await.unwrap();
    assert!(matches!(outcome.status, SyncStatus::Failed | SyncStatus::Success));

    let ids_after = store.list_existing_trade_ids(user_id, Exchange::Bybit).await.unwrap();
    assert!(ids_after.contains("already-there"));
}

/// Leverage overrides set on the store are visible to (and would be
/// applied by) the orchestrator's resolve step via `get_leverage_overrides`.
#[tokio::test]
async fn leverage_overrides_are_readable_through_the_store_seam() {
    let memory_store = InMemoryStore::new();
    let user_id = uuid::Uuid::new_v4();
    let overrides = std::collections::HashMap::from([("ETH-USDT".to_string(), dec!(3))]);
    memory_store
        .set_leverage_overrides(user_id, Exchange::Binance, overrides)
        .await;

    let fetched = memory_store.get_leverage_overrides(user_id, Exchange::Binance).await.unwrap();
    assert_eq!(fetched.get("ETH-USDT"), Some(&dec!(3)));
}

/// `sync_connection` on an unknown connection id is an error, not a panic.
#[tokio::test]
async fn sync_unknown_connection_errors() {
    let cipher = Arc::new(test_cipher());
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orchestrator = SyncOrchestrator::new(store, cipher);

    let result = orchestrator.sync_connection(uuid::Uuid::new_v4()).await;
    assert!(result.is_err());
}
