//! Binance USDT-M Futures client + fill aggregator.
//!
//! Grounded on `original_source/backend/app/services/binance_client.py`:
//! `_sign`/`_request` (signed-params HMAC), `_get_traded_symbols` (position
//! discovery with the `{BTCUSDT, ETHUSDT}` hardcoded fallback), the 7-day
//! pagination window in `_fetch_symbol_trades`, and `aggregate_binance_trades`
//! (exit-run/entry-run grouping).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::{default_http_client, hmac_sha256_hex, ExchangeClient};
use crate::error::{classify_http_error, ExchangeError};
use crate::models::trade::{LogicalTrade, Side};

const BASE_URL: &str = "https://fapi.binance.com";
const SEVEN_DAYS_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const LOOKBACK_MS: i64 = 180 * 24 * 60 * 60 * 1000;
const FALLBACK_SYMBOLS: [&str; 4] = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT"];

pub struct BinanceClient {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PositionRiskEntry {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    leverage: String,
}

#[derive(Debug, Deserialize)]
struct AccountPosition {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "unrealizedProfit")]
    unrealized_profit: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    positions: Vec<AccountPosition>,
}

#[derive(Debug, Deserialize)]
struct IncomeEntry {
    symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UserTrade {
    id: i64,
    symbol: String,
    side: String,
    price: String,
    qty: String,
    #[serde(rename = "realizedPnl")]
    realized_pnl: String,
    commission: String,
    time: i64,
}

impl BinanceClient {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            http: default_http_client(),
            api_key,
            api_secret,
            base_url: BASE_URL.to_string(),
        }
    }

    fn sign(&self, params: &BTreeMap<String, String>) -> String {
        let query = serde_urlencoded::to_string(params).unwrap_or_default();
        hmac_sha256_hex(&self.api_secret, &query)
    }

    async fn signed_get(&self, path: &str, params: BTreeMap<String, String>) -> Result<serde_json::Value, ExchangeError> {
        super::with_retry(|| self.signed_get_once(path, params.clone())).await
    }

    async fn signed_get_once(&self, path: &str, mut params: BTreeMap<String, String>) -> Result<serde_json::Value, ExchangeError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ExchangeError::Internal(e.to_string()))?
            .as_millis();
        params.insert("timestamp".into(), timestamp.to_string());
        let signature = self.sign(&params);
        params.insert("signature".into(), signature);

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .query(&params)
            .send()
            .await
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let code = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("code").and_then(|c| c.as_i64()).map(|c| c.to_string()));
            return Err(classify_http_error(status.as_u16(), code.as_deref(), &body));
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::Internal(format!("bad JSON from Binance: {e}")))
    }

    async fn fetch_position_risk(&self) -> Result<Vec<PositionRiskEntry>, ExchangeError> {
        let value = self.signed_get("/fapi/v2/positionRisk", BTreeMap::new()).await?;
        serde_json::from_value(value).map_err(|e| ExchangeError::Internal(e.to_string()))
    }

    async fn fetch_leverage_map(&self) -> BTreeMap<String, f64> {
        match self.fetch_position_risk().await {
            Ok(positions) => positions
                .into_iter()
                .filter_map(|p| p.leverage.parse::<f64>().ok().map(|lev| (p.symbol, lev)))
                .collect(),
            Err(e) => {
                warn!("failed to fetch Binance leverage settings: {e}");
                BTreeMap::new()
            }
        }
    }

    async fn traded_symbols(&self) -> Vec<String> {
        let account: Option<AccountInfo> = self
            .signed_get("/fapi/v2/account", BTreeMap::new())
            .await
            .ok()
            .and_then(|v| serde_json::from_value(v).ok());
        let position_risk = self.fetch_position_risk().await.unwrap_or_default();

        let mut symbols = std::collections::BTreeSet::new();
        if let Some(account) = account {
            for pos in account.positions {
                let amt: f64 = pos.position_amt.parse().unwrap_or(0.0);
                let upnl: f64 = pos.unrealized_profit.parse().unwrap_or(0.0);
                if amt != 0.0 || upnl != 0.0 {
                    symbols.insert(pos.symbol);
                }
            }
        }
        for pos in position_risk {
            let amt: f64 = pos.position_amt.parse().unwrap_or(0.0);
            if amt != 0.0 {
                symbols.insert(pos.symbol);
            }
        }

        if symbols.is_empty() {
            symbols = self.symbols_from_income().await;
        }

        if symbols.is_empty() {
            warn!("no traded Binance symbols found, falling back to common pairs");
            return FALLBACK_SYMBOLS.iter().map(|s| s.to_string()).collect();
        }

        symbols.into_iter().collect()
    }

    async fn symbols_from_income(&self) -> std::collections::BTreeSet<String> {
        let end = now_ms();
        let start = end - LOOKBACK_MS;
        let mut symbols = std::collections::BTreeSet::new();

        let mut window_start = start;
        while window_start < end {
            let window_end = (window_start + SEVEN_DAYS_MS).min(end);
            let mut params = BTreeMap::new();
            params.insert("incomeType".into(), "REALIZED_PNL".into());
            params.insert("startTime".into(), window_start.to_string());
            params.insert("endTime".into(), window_end.to_string());
            params.insert("limit".into(), "1000".into());

            if let Ok(value) = self.signed_get("/fapi/v1/income", params).await {
                if let Ok(entries) = serde_json::from_value::<Vec<IncomeEntry>>(value) {
                    for entry in entries {
                        if !entry.symbol.is_empty() {
                            symbols.insert(entry.symbol);
                        }
                    }
                }
            }
            window_start = window_end;
        }
        symbols
    }

    async fn fetch_symbol_trades(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
    ) -> Vec<UserTrade> {
        let mut trades = Vec::new();
        let mut window_start = start_time;

        while window_start < end_time {
            let window_end = (window_start + SEVEN_DAYS_MS).min(end_time);
            let mut params = BTreeMap::new();
            params.insert("symbol".into(), symbol.to_string());
            params.insert("startTime".into(), window_start.to_string());
            params.insert("endTime".into(), window_end.to_string());
            params.insert("limit".into(), "1000".into());

            match self.signed_get("/fapi/v1/userTrades", params.clone()).await {
                Ok(value) => match serde_json::from_value::<Vec<UserTrade>>(value) {
                    Ok(mut page) => {
                        let full_page = page.len() == 1000;
                        trades.append(&mut page);
                        // paginate within the 7-day window via fromId, same as the
                        // Python client, until a short page signals exhaustion.
                        let mut keep_going = full_page;
                        while keep_going {
                            let Some(last_id) = trades.last().map(|t| t.id) else { break };
                            let mut follow_up = params.clone();
                            follow_up.insert("fromId".into(), (last_id + 1).to_string());
                            match self.signed_get("/fapi/v1/userTrades", follow_up).await {
                                Ok(v) => match serde_json::from_value::<Vec<UserTrade>>(v) {
                                    Ok(mut more) => {
                                        keep_going = more.len() == 1000;
                                        trades.append(&mut more);
                                    }
                                    Err(_) => keep_going = false,
                                },
                                Err(e) => {
                                    warn!("error paginating {symbol} trades: {e}");
                                    keep_going = false;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("bad userTrades payload for {symbol}: {e}"),
                },
                Err(e) => warn!("error fetching {symbol} trades ({window_start}-{window_end}): {e}"),
            }
            window_start = window_end;
        }

        trades
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn validate_credentials(&self) -> Result<bool, ExchangeError> {
        self.signed_get("/fapi/v2/account", BTreeMap::new()).await?;
        Ok(true)
    }

    async fn fetch_trade_history(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogicalTrade>, ExchangeError> {
        let end_time = now_ms();
        let start_time = since.map(|t| t.timestamp_millis()).unwrap_or(end_time - LOOKBACK_MS);

        let symbols = self.traded_symbols().await;
        debug!("fetching Binance trades for {} symbols", symbols.len());

        let mut all_trades = Vec::new();
        for symbol in &symbols {
            let mut symbol_trades = self.fetch_symbol_trades(symbol, start_time, end_time).await;
            all_trades.append(&mut symbol_trades);
        }
        all_trades.sort_by_key(|t| std::cmp::Reverse(t.time));

        let leverage_map = self.fetch_leverage_map().await;
        Ok(aggregate_binance_trades(all_trades, &leverage_map))
    }
}

/// Group raw fills into positions (exit-run then entry-run per symbol,
/// newest-first) and size-weight the entry/exit prices.
fn aggregate_binance_trades(trades: Vec<UserTrade>, leverage_map: &BTreeMap<String, f64>) -> Vec<LogicalTrade> {
    let mut by_symbol: BTreeMap<String, Vec<UserTrade>> = BTreeMap::new();
    for trade in trades {
        by_symbol.entry(trade.symbol.clone()).or_default().push(trade);
    }

    let mut out = Vec::new();

    for (_, mut symbol_trades) in by_symbol {
        symbol_trades.sort_by_key(|t| std::cmp::Reverse(t.time));

        let mut i = 0;
        while i < symbol_trades.len() {
            let mut position_trades = Vec::new();

            while i < symbol_trades.len() && pnl_of(&symbol_trades[i]) != 0.0 {
                position_trades.push(symbol_trades[i].clone());
                i += 1;
            }
            while i < symbol_trades.len() && pnl_of(&symbol_trades[i]) == 0.0 {
                position_trades.push(symbol_trades[i].clone());
                i += 1;
            }

            let has_entry = position_trades.iter().any(|t| pnl_of(t) == 0.0);
            let has_exit = position_trades.iter().any(|t| pnl_of(t) != 0.0);
            if !has_entry || !has_exit || position_trades.is_empty() {
                continue;
            }

            if let Some(logical) = aggregate_position(position_trades, leverage_map) {
                out.push(logical);
            }
        }
    }

    out
}

fn pnl_of(t: &UserTrade) -> f64 {
    t.realized_pnl.parse().unwrap_or(0.0)
}

fn aggregate_position(position_trades: Vec<UserTrade>, leverage_map: &BTreeMap<String, f64>) -> Option<LogicalTrade> {
    let (entry_trades, exit_trades): (Vec<_>, Vec<_>) =
        position_trades.iter().cloned().partition(|t| pnl_of(t) == 0.0);

    let total_entry_qty: f64 = entry_trades.iter().map(|t| t.qty.parse::<f64>().unwrap_or(0.0)).sum();
    let avg_entry_price = if total_entry_qty > 0.0 {
        entry_trades
            .iter()
            .map(|t| t.price.parse::<f64>().unwrap_or(0.0) * t.qty.parse::<f64>().unwrap_or(0.0))
            .sum::<f64>()
            / total_entry_qty
    } else {
        entry_trades.first().and_then(|t| t.price.parse().ok()).unwrap_or(0.0)
    };

    let total_exit_qty: f64 = exit_trades.iter().map(|t| t.qty.parse::<f64>().unwrap_or(0.0)).sum();
    let avg_exit_price = if total_exit_qty > 0.0 {
        exit_trades
            .iter()
            .map(|t| t.price.parse::<f64>().unwrap_or(0.0) * t.qty.parse::<f64>().unwrap_or(0.0))
            .sum::<f64>()
            / total_exit_qty
    } else {
        exit_trades.first().and_then(|t| t.price.parse().ok()).unwrap_or(0.0)
    };

    let total_pnl: f64 = position_trades.iter().map(pnl_of).sum();
    let total_fees: f64 = position_trades.iter().map(|t| t.commission.parse::<f64>().unwrap_or(0.0)).sum();

    let first_trade = entry_trades.first().or_else(|| position_trades.first())?;
    let symbol = first_trade.symbol.clone();
    let side = if first_trade.side == "BUY" { Side::Buy } else { Side::Sell };

    let entry_ts = entry_trades.last().map(|t| t.time).unwrap_or_else(|| position_trades.last().map(|t| t.time).unwrap_or(0));
    let exit_ts = exit_trades.first().map(|t| t.time).unwrap_or_else(|| position_trades.first().map(|t| t.time).unwrap_or(0));

    let leverage = leverage_map.get(&symbol).copied();

    Some(LogicalTrade {
        raw_symbol: symbol,
        side,
        entry_price: avg_entry_price,
        exit_price: avg_exit_price,
        quantity: total_entry_qty,
        realized_pnl: total_pnl,
        fees: total_fees,
        entry_time: millis_to_datetime(entry_ts),
        exit_time: millis_to_datetime(exit_ts),
        leverage,
        exchange_trade_id: first_trade.id.to_string(),
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(id: i64, symbol: &str, side: &str, price: &str, qty: &str, pnl: &str, time: i64) -> UserTrade {
        UserTrade {
            id,
            symbol: symbol.into(),
            side: side.into(),
            price: price.into(),
            qty: qty.into(),
            realized_pnl: pnl.into(),
            commission: "0.1".into(),
            time,
        }
    }

    #[test]
    fn scenario_1_exit_then_entry_run_groups_into_one_position() {
        // newest-first: exit leg (pnl != 0) followed by entry leg (pnl == 0)
        let trades = vec![
            trade(2, "BTCUSDT", "SELL", "51000", "0.1", "100.0", 2_000),
            trade(1, "BTCUSDT", "BUY", "50000", "0.1", "0", 1_000),
        ];
        let logical = aggregate_binance_trades(trades, &BTreeMap::new());
        assert_eq!(logical.len(), 1);
        let t = &logical[0];
        assert_eq!(t.entry_price, 50000.0);
        assert_eq!(t.exit_price, 51000.0);
        assert_eq!(t.quantity, 0.1);
        assert_eq!(t.realized_pnl, 100.0);
    }

    #[test]
    fn incomplete_position_missing_exit_is_dropped() {
        let trades = vec![trade(1, "ETHUSDT", "BUY", "3000", "1", "0", 1_000)];
        assert!(aggregate_binance_trades(trades, &BTreeMap::new()).is_empty());
    }

    #[test]
    fn leverage_map_applied_when_present() {
        let trades = vec![
            trade(2, "BTCUSDT", "SELL", "51000", "0.1", "100.0", 2_000),
            trade(1, "BTCUSDT", "BUY", "50000", "0.1", "0", 1_000),
        ];
        let mut map = BTreeMap::new();
        map.insert("BTCUSDT".to_string(), 10.0);
        let logical = aggregate_binance_trades(trades, &map);
        assert_eq!(logical[0].leverage, Some(10.0));
    }
}
