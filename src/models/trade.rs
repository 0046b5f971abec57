use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::connection::Exchange;

/// Position direction. Exchanges report this with different vocabularies
/// (Binance/Blofin: BUY/SELL entry side; Bybit: Buy/Sell; Hyperliquid:
/// Open Long/Short) — the normalizer (`normalize::side_from_*`) maps all
/// of them onto this one uppercase-cased type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        })
    }
}

/// Pre-normalization aggregation result (spec §3 "Position / LogicalTrade").
/// Produced by a `Fill Aggregator`, consumed by the `Normalizer`. Values are
/// plain `f64` — the clamp/rounding boundary is normalization, not
/// aggregation (spec §9).
#[derive(Debug, Clone)]
pub struct LogicalTrade {
    pub raw_symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub fees: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    /// `Some(lev)` when the exchange supplied leverage for this record
    /// (Bybit always; Binance/Blofin via their leverage maps); `None`
    /// otherwise, deferring to the Leverage Resolver (C4).
    pub leverage: Option<f64>,
    /// Stable per-exchange identifier, used by the Deduplicator (C5).
    pub exchange_trade_id: String,
}

/// The normalized output record, what downstream (the trade store)
/// consumes. All monetary/size fields are `Decimal` — this is the
/// boundary where `f64` aggregation math becomes fixed-precision output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTrade {
    pub user_id: uuid::Uuid,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub leverage: Decimal,
    pub fees: Decimal,
    pub pnl_usd: Decimal,
    pub pnl_percent: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub exchange_trade_id: String,
}

impl CanonicalTrade {
    /// Universal invariants a CanonicalTrade must satisfy (spec §8).
    pub fn satisfies_invariants(&self) -> bool {
        self.entry_price > Decimal::ZERO
            && self.exit_price > Decimal::ZERO
            && self.quantity > Decimal::ZERO
            && self.leverage >= Decimal::ONE
            && self.leverage <= Decimal::from(200)
            && self.exit_time >= self.entry_time
            && symbol_is_well_formed(&self.symbol)
    }
}

/// `^[A-Z0-9]+-[A-Z0-9]+$`
pub fn symbol_is_well_formed(symbol: &str) -> bool {
    let Some((base, quote)) = symbol.split_once('-') else {
        return false;
    };
    let is_valid_part = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    is_valid_part(base) && is_valid_part(quote) && !quote.contains('-')
}

/// (user, exchange, symbol) -> leverage. User-owned, read-only during sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeverageOverride {
    pub user_id: uuid::Uuid,
    pub exchange: Exchange,
    pub symbol: String,
    pub leverage: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_pattern_accepts_canonical_form() {
        assert!(symbol_is_well_formed("BTC-USDT"));
        assert!(symbol_is_well_formed("1000SHIB-USDT"));
    }

    #[test]
    fn symbol_pattern_rejects_malformed() {
        assert!(!symbol_is_well_formed("BTCUSDT"));
        assert!(!symbol_is_well_formed("btc-usdt"));
        assert!(!symbol_is_well_formed("BTC-USD-T"));
        assert!(!symbol_is_well_formed("-USDT"));
    }
}
