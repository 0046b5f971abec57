//! Normalizer (C3): pure `LogicalTrade -> Option<CanonicalTrade>` mapping.
//!
//! Grounded on the `round_value`/numeric-clamp helper repeated in every
//! `calculate_*_trade_fields` function of the original per-exchange sync
//! routes — centralized here as one module since spec §9 calls the clamp
//! out as a shared convention, not an exchange-specific quirk.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::models::connection::Exchange;
use crate::models::trade::{CanonicalTrade, LogicalTrade, Side};

const MAX_PRICE: f64 = 1e6;
const MAX_SIZE: f64 = 1e6;
const MAX_PNL: f64 = 1e5;
const MAX_LEVERAGE: f64 = 125.0;
const CLAMP_BOUND: f64 = 1e15;

/// Any input outside (-1e15, 1e15), NaN, or +/-inf becomes 0; any value
/// whose absolute value exceeds `field_max` also becomes 0 (spec §4.3).
pub fn normalize_numeric_value(value: f64, field_max: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    if !(value > -CLAMP_BOUND && value < CLAMP_BOUND) {
        return 0.0;
    }
    if value.abs() > field_max {
        return 0.0;
    }
    value
}

/// `*USDT -> *-USDT`, `*BUSD -> *-BUSD`, `*USDC -> *-USDC`. Hyperliquid's
/// bare `COIN` symbols are canonicalized separately via
/// `canonicalize_hyperliquid_symbol` since HL never sends a quote suffix.
pub fn canonicalize_symbol(raw: &str) -> Option<String> {
    let raw = raw.to_ascii_uppercase();
    for quote in ["USDT", "BUSD", "USDC"] {
        if let Some(base) = raw.strip_suffix(quote) {
            if !base.is_empty() {
                return Some(format!("{base}-{quote}"));
            }
        }
    }
    None
}

/// Hyperliquid's `COIN` becomes `COIN-USDC` (spec §4.3 rule 1).
pub fn canonicalize_hyperliquid_symbol(coin: &str) -> String {
    format!("{}-USDC", coin.to_ascii_uppercase())
}

fn round_decimal(value: f64, places: u32) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or(Decimal::ZERO)
        .round_dp(places)
}

/// Whether a zero-PnL record should be dropped as an unmatched entry leg.
/// Binance and Blofin ship raw fills, so a `pnl_usd == 0` record really is
/// an open entry; Bybit and Hyperliquid already return completed rounds
/// and may legitimately close at breakeven.
fn drops_zero_pnl(exchange: Exchange) -> bool {
    matches!(exchange, Exchange::Binance | Exchange::Blofin)
}

/// Normalize one LogicalTrade into a CanonicalTrade, or `None` if it fails
/// a validity invariant (spec §4.3 step 3 — the record is dropped, not
/// errored; see spec §7 VALIDATION_ERROR propagation policy).
pub fn normalize(
    user_id: uuid::Uuid,
    exchange: Exchange,
    symbol: String,
    trade: &LogicalTrade,
) -> Option<CanonicalTrade> {
    let entry_price = normalize_numeric_value(trade.entry_price, MAX_PRICE);
    let exit_price = normalize_numeric_value(trade.exit_price, MAX_PRICE);
    let quantity = normalize_numeric_value(trade.quantity, MAX_SIZE);
    let fees = normalize_numeric_value(trade.fees, MAX_PRICE);
    let pnl_usd = normalize_numeric_value(trade.realized_pnl, MAX_PNL);

    if entry_price == 0.0 || exit_price == 0.0 {
        return None;
    }
    if pnl_usd == 0.0 && drops_zero_pnl(exchange) {
        return None;
    }

    let side = match trade.side {
        Side::Long => Side::Buy,
        Side::Short => Side::Sell,
        other => other,
    };

    Some(CanonicalTrade {
        user_id,
        exchange,
        symbol,
        side,
        entry_price: round_decimal(entry_price, 8),
        exit_price: round_decimal(exit_price, 8),
        quantity: round_decimal(quantity, 8),
        // Leverage is resolved by C4 after this step; placeholder here.
        leverage: Decimal::ZERO,
        fees: round_decimal(fees, 8),
        pnl_usd: round_decimal(pnl_usd, 2),
        pnl_percent: Decimal::ZERO,
        entry_time: trade.entry_time,
        exit_time: trade.exit_time,
        exchange_trade_id: trade.exchange_trade_id.clone(),
    })
}

/// Clamp a leverage value per spec's numeric-safety rules (`leverage <= 125`
/// in §4.3's clamp table, further bounded to `[1, 200]` at the
/// CanonicalTrade invariant in §8 — the resolver in C4 enforces the
/// latter after applying overrides/defaults).
pub fn clamp_leverage(value: f64) -> f64 {
    normalize_numeric_value(value, MAX_LEVERAGE)
}
