//! Hyperliquid client + open/close fill aggregator. No API key: trading
//! history is on-chain and keyed by wallet address alone, so there is
//! nothing to sign (spec §4.1's fourth, unsigned scheme).
//!
//! Grounded on `original_source/backend/app/services/hyperliquid_client.py`:
//! `fetch_user_fills` (unsigned POST `/info`, 2000-fill cap, no pagination)
//! and `aggregate_hyperliquid_fills` (open-position table keyed by
//! `{coin}_{side}`, folding Open/Close fills oldest-first).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{default_http_client, ExchangeClient};
use crate::error::ExchangeError;
use crate::models::trade::{LogicalTrade, Side};

const BASE_URL: &str = "https://api.hyperliquid.xyz";
pub const DEFAULT_LEVERAGE: f64 = 10.0;

pub struct HyperliquidClient {
    http: reqwest::Client,
    wallet_address: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct InfoRequest<'a> {
    #[serde(rename = "type")]
    request_type: &'a str,
    user: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UserFill {
    coin: String,
    px: String,
    sz: String,
    side: String,
    time: i64,
    #[serde(rename = "closedPnl")]
    closed_pnl: String,
    fee: String,
    #[serde(default)]
    dir: String,
    #[serde(default)]
    tid: serde_json::Value,
}

impl HyperliquidClient {
    pub fn new(wallet_address: String) -> Self {
        Self {
            http: default_http_client(),
            wallet_address: wallet_address.to_ascii_lowercase(),
            base_url: BASE_URL.to_string(),
        }
    }

    async fn fetch_user_fills(&self) -> Result<Vec<UserFill>, ExchangeError> {
        super::with_retry(|| self.fetch_user_fills_once()).await
    }

    async fn fetch_user_fills_once(&self) -> Result<Vec<UserFill>, ExchangeError> {
        let url = format!("{}/info", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&InfoRequest {
                request_type: "userFills",
                user: self.wallet_address.clone(),
            })
            .send()
            .await
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(crate::error::classify_http_error(status.as_u16(), None, &body));
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::Internal(format!("bad JSON from Hyperliquid: {e}")))
    }
}

fn is_valid_wallet_address(address: &str) -> bool {
    let addr = address.strip_prefix("0x").unwrap_or(address);
    addr.len() == 40 && addr.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl ExchangeClient for HyperliquidClient {
    async fn validate_credentials(&self) -> Result<bool, ExchangeError> {
        if !is_valid_wallet_address(&self.wallet_address) {
            return Err(ExchangeError::ValidationError(format!(
                "'{}' is not a valid Hyperliquid wallet address",
                self.wallet_address
            )));
        }
        let fills = self.fetch_user_fills().await?;
        Ok(!fills.is_empty())
    }

    async fn fetch_trade_history(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogicalTrade>, ExchangeError> {
        let fills = self.fetch_user_fills().await?;
        let since_ms = since.map(|t| t.timestamp_millis());
        let filtered: Vec<UserFill> = fills
            .into_iter()
            .filter(|f| since_ms.map(|cutoff| f.time >= cutoff).unwrap_or(true))
            .collect();
        Ok(aggregate_hyperliquid_fills(filtered, DEFAULT_LEVERAGE))
    }
}

fn fill_side(fill: &UserFill) -> Side {
    if fill.dir.contains("Long") {
        Side::Buy
    } else if fill.dir.contains("Short") {
        Side::Sell
    } else if fill.side == "A" {
        Side::Sell
    } else {
        Side::Buy
    }
}

struct OpenPosition {
    coin: String,
    side: Side,
    total_size: f64,
    total_cost: f64,
    entry_time: DateTime<Utc>,
    fees: f64,
}

/// Fold Open/Close fills (oldest-first) into complete round-trips, keyed by
/// `{coin}_{side}` per spec §4.5. A Close with no matching Open position is
/// emitted as a standalone trade using itself as both entry and exit leg.
fn aggregate_hyperliquid_fills(fills: Vec<UserFill>, default_leverage: f64) -> Vec<LogicalTrade> {
    let mut sorted = fills;
    sorted.sort_by_key(|f| f.time);

    let mut positions: HashMap<String, OpenPosition> = HashMap::new();
    let mut completed = Vec::new();

    for fill in &sorted {
        let price: f64 = fill.px.parse().unwrap_or(0.0);
        let size: f64 = fill.sz.parse().unwrap_or(0.0);
        if price == 0.0 || size == 0.0 {
            continue;
        }
        let pnl: f64 = fill.closed_pnl.parse().unwrap_or(0.0);
        let fee: f64 = fill.fee.parse().unwrap_or(0.0);
        let side = fill_side(fill);
        let coin = fill.coin.to_ascii_uppercase();
        let key = format!("{coin}_{side}");
        let time = millis_to_datetime(fill.time);

        if fill.dir.contains("Open") {
            let pos = positions.entry(key).or_insert_with(|| OpenPosition {
                coin: coin.clone(),
                side,
                total_size: 0.0,
                total_cost: 0.0,
                entry_time: time,
                fees: 0.0,
            });
            pos.total_size += size;
            pos.total_cost += price * size;
            pos.fees += fee;
        } else if fill.dir.contains("Close") {
            if let Some(pos) = positions.get_mut(&key) {
                if pos.total_size > 0.0 {
                    let avg_entry = pos.total_cost / pos.total_size;
                    let matched_qty = size.min(pos.total_size);

                    completed.push(LogicalTrade {
                        raw_symbol: coin.clone(),
                        side,
                        entry_price: avg_entry,
                        exit_price: price,
                        quantity: matched_qty,
                        realized_pnl: pnl,
                        fees: pos.fees + fee,
                        entry_time: pos.entry_time,
                        exit_time: time,
                        leverage: Some(default_leverage),
                        exchange_trade_id: crate::dedup::hyperliquid_trade_id(&coin, pos.entry_time.timestamp_millis()),
                    });

                    pos.total_size -= size;
                    if pos.total_size <= 0.0 {
                        positions.remove(&key);
                    } else {
                        pos.total_cost = avg_entry * pos.total_size;
                        pos.fees = 0.0;
                    }
                } else {
                    completed.push(standalone_close(&coin, side, price, size, pnl, fee, time, default_leverage));
                }
            } else {
                completed.push(standalone_close(&coin, side, price, size, pnl, fee, time, default_leverage));
            }
        }
    }

    completed
}

#[allow(clippy::too_many_arguments)]
fn standalone_close(
    coin: &str,
    side: Side,
    price: f64,
    size: f64,
    pnl: f64,
    fee: f64,
    time: DateTime<Utc>,
    default_leverage: f64,
) -> LogicalTrade {
    LogicalTrade {
        raw_symbol: coin.to_string(),
        side,
        entry_price: price,
        exit_price: price,
        quantity: size,
        realized_pnl: pnl,
        fees: fee,
        entry_time: time,
        exit_time: time,
        leverage: Some(default_leverage),
        exchange_trade_id: crate::dedup::hyperliquid_trade_id(coin, time.timestamp_millis()),
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(coin: &str, px: &str, sz: &str, pnl: &str, dir: &str, time: i64, side: &str) -> UserFill {
        UserFill {
            coin: coin.into(),
            px: px.into(),
            sz: sz.into(),
            side: side.into(),
            time,
            closed_pnl: pnl.into(),
            fee: "0.5".into(),
            dir: dir.into(),
            tid: serde_json::Value::Null,
        }
    }

    #[test]
    fn scenario_5_open_long_then_close_long() {
        let fills = vec![
            fill("ETH", "3000", "2", "0", "Open Long", 1_000, "B"),
            fill("ETH", "3100", "2", "200.0", "Close Long", 2_000, "A"),
        ];
        let out = aggregate_hyperliquid_fills(fills, DEFAULT_LEVERAGE);
        assert_eq!(out.len(), 1);
        let t = &out[0];
        assert_eq!(t.entry_price, 3000.0);
        assert_eq!(t.exit_price, 3100.0);
        assert_eq!(t.quantity, 2.0);
        assert_eq!(t.leverage, Some(10.0));
    }

    #[test]
    fn close_without_matching_open_is_standalone() {
        let fills = vec![fill("BTC", "50000", "1", "500.0", "Close Long", 1_000, "A")];
        let out = aggregate_hyperliquid_fills(fills, DEFAULT_LEVERAGE);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry_price, out[0].exit_price);
    }

    #[test]
    fn partial_close_decrements_remaining_position() {
        let fills = vec![
            fill("SOL", "100", "10", "0", "Open Long", 1_000, "B"),
            fill("SOL", "110", "4", "40.0", "Close Long", 2_000, "A"),
            fill("SOL", "120", "6", "120.0", "Close Long", 3_000, "A"),
        ];
        let out = aggregate_hyperliquid_fills(fills, DEFAULT_LEVERAGE);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].quantity, 4.0);
        assert_eq!(out[1].quantity, 6.0);
    }

    #[test]
    fn wallet_address_validation() {
        assert!(is_valid_wallet_address("0x1234567890123456789012345678901234567890"));
        assert!(!is_valid_wallet_address("not-an-address"));
    }
}
