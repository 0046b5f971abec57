//! Leverage Resolver (C4): fills in leverage gaps and recomputes pnl_percent.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::models::trade::CanonicalTrade;

/// Default leverage when neither the exchange nor a user override supplies
/// one. Hyperliquid never reports leverage, so its default is 10x (spec
/// §4.4/§9's "arbitrary... a per-user setting should override it" open
/// question — we keep it as the literal fallback and let
/// `LeverageOverride` take precedence, same as every other exchange).
pub const DEFAULT_LEVERAGE: Decimal = Decimal::ONE;
pub const HYPERLIQUID_DEFAULT_LEVERAGE: Decimal = Decimal::TEN;

/// Resolve leverage for one trade and recompute `pnl_percent`.
///
/// Precedence: exchange-supplied (`exchange_leverage`, already on the
/// trade if > 0) > user override (`overrides`) > exchange default.
pub fn resolve(
    trade: &mut CanonicalTrade,
    exchange_leverage: Option<f64>,
    overrides: &HashMap<String, Decimal>,
    exchange_default: Decimal,
) {
    let resolved = match exchange_leverage {
        Some(lev) if lev > 0.0 => Decimal::from_f64(lev).unwrap_or(exchange_default),
        _ => overrides
            .get(&trade.symbol)
            .copied()
            .unwrap_or(exchange_default),
    };

    trade.leverage = resolved.round_dp(2);
    trade.pnl_percent = recompute_pnl_percent(trade.pnl_usd, trade.entry_price, trade.quantity, trade.leverage);
}

/// `pnl_percent = (pnl_usd / (entry_price * quantity / leverage)) * 100`,
/// guarding the zero-denominator case (spec §4.4).
pub fn recompute_pnl_percent(
    pnl_usd: Decimal,
    entry_price: Decimal,
    quantity: Decimal,
    leverage: Decimal,
) -> Decimal {
    if leverage <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let position_value = entry_price * quantity;
    let margin_used = position_value / leverage;
    if margin_used == Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((pnl_usd / margin_used) * Decimal::from(100)).round_dp(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::connection::Exchange;
    use crate::models::trade::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_trade() -> CanonicalTrade {
        CanonicalTrade {
            user_id: uuid::Uuid::nil(),
            exchange: Exchange::Binance,
            symbol: "BTC-USDT".into(),
            side: Side::Buy,
            entry_price: dec!(50000),
            exit_price: dec!(51000),
            quantity: dec!(0.1),
            leverage: Decimal::ZERO,
            fees: dec!(2.02),
            pnl_usd: dec!(100.00),
            pnl_percent: Decimal::ZERO,
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            exchange_trade_id: "t1".into(),
        }
    }

    #[test]
    fn exchange_supplied_leverage_wins() {
        let mut trade = sample_trade();
        let overrides = HashMap::from([("BTC-USDT".to_string(), dec!(5))]);
        resolve(&mut trade, Some(10.0), &overrides, DEFAULT_LEVERAGE);
        assert_eq!(trade.leverage, dec!(10.00));
        assert_eq!(trade.pnl_percent, dec!(20.0000));
    }

    #[test]
    fn falls_back_to_user_override_when_exchange_silent() {
        let mut trade = sample_trade();
        let overrides = HashMap::from([("BTC-USDT".to_string(), dec!(5))]);
        resolve(&mut trade, None, &overrides, DEFAULT_LEVERAGE);
        assert_eq!(trade.leverage, dec!(5.00));
    }

    #[test]
    fn falls_back_to_exchange_default_when_nothing_else() {
        let mut trade = sample_trade();
        resolve(&mut trade, None, &HashMap::new(), HYPERLIQUID_DEFAULT_LEVERAGE);
        assert_eq!(trade.leverage, dec!(10.00));
    }

    #[test]
    fn zero_denominator_guarded() {
        let pct = recompute_pnl_percent(dec!(100), Decimal::ZERO, dec!(1), dec!(10));
        assert_eq!(pct, Decimal::ZERO);
    }

    #[test]
    fn scenario_4_bybit_pnl_percent() {
        let pct = recompute_pnl_percent(dec!(-100), dec!(30000), dec!(0.2), dec!(5));
        assert_eq!(pct, dec!(-8.3333));
    }
}
