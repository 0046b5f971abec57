//! Deduplicator (C5): filters a sync run's CanonicalTrades against the set
//! of `exchange_trade_id`s already persisted for (user, exchange).

use std::collections::HashSet;

use crate::models::trade::CanonicalTrade;

/// Keep only trades whose `exchange_trade_id` is absent from `existing_ids`.
/// Set-based and order-agnostic, per spec §5's dedup ordering guarantee.
pub fn deduplicate(trades: Vec<CanonicalTrade>, existing_ids: &HashSet<String>) -> Vec<CanonicalTrade> {
    trades
        .into_iter()
        .filter(|t| !existing_ids.contains(&t.exchange_trade_id))
        .collect()
}

/// Hyperliquid has no native stable per-fill identifier once fills are
/// folded into a position — spec §4.5 mandates `coin_entryTimeMs` as the
/// dedup key for its aggregator output.
pub fn hyperliquid_trade_id(coin: &str, entry_time_ms: i64) -> String {
    format!("{}_{}", coin.to_ascii_uppercase(), entry_time_ms)
}
