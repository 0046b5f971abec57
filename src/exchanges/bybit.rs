//! Bybit V5 closed-PnL client. Unlike Binance/Blofin, Bybit's
//! `/v5/position/closed-pnl` endpoint already returns matched round-trips —
//! there is no fill aggregation to do, only a passthrough field mapping.
//!
//! Grounded on `original_source/backend/app/services/bybit_client.py`:
//! `_sign` (timestamp+api_key+recv_window+sorted-query), `fetch_closed_pnl`
//! (7-day windows within a 730-day lookback, `nextPageCursor` pagination),
//! `calculate_bybit_trade_fields` (native leverage, flat 6bp fee estimate).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use super::{default_http_client, hmac_sha256_hex, ExchangeClient};
use crate::error::ExchangeError;
use crate::models::trade::{LogicalTrade, Side};

const BASE_URL: &str = "https://api.bybit.com";
const RECV_WINDOW: &str = "5000";
const SEVEN_DAYS_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const LOOKBACK_MS: i64 = 730 * 24 * 60 * 60 * 1000;
const PAGE_LIMIT: u32 = 100;
/// Bybit's closed-PnL response has no fee field; approximate with the
/// typical linear-perp taker rate, same literal constant the Python
/// client uses.
const FLAT_FEE_RATE: f64 = 0.0006;

pub struct BybitClient {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ClosedPnlResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: ClosedPnlResult,
}

#[derive(Debug, Deserialize, Default)]
struct ClosedPnlResult {
    list: Vec<ClosedPnlRecord>,
    #[serde(rename = "nextPageCursor")]
    next_page_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClosedPnlRecord {
    symbol: String,
    side: String,
    #[serde(rename = "avgEntryPrice")]
    avg_entry_price: String,
    #[serde(rename = "avgExitPrice")]
    avg_exit_price: String,
    qty: String,
    #[serde(rename = "closedPnl")]
    closed_pnl: String,
    leverage: String,
    #[serde(rename = "cumEntryValue")]
    cum_entry_value: String,
    #[serde(rename = "cumExitValue")]
    cum_exit_value: String,
    #[serde(rename = "createdTime")]
    created_time: String,
    #[serde(rename = "updatedTime")]
    updated_time: String,
    #[serde(rename = "orderId")]
    order_id: String,
}

impl BybitClient {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            http: default_http_client(),
            api_key,
            api_secret,
            base_url: BASE_URL.to_string(),
        }
    }

    fn sign(&self, timestamp: &str, query: &str) -> String {
        let payload = format!("{timestamp}{}{RECV_WINDOW}{query}", self.api_key);
        hmac_sha256_hex(&self.api_secret, &payload)
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<ClosedPnlResult, ExchangeError> {
        super::with_retry(|| self.get_once(path, params)).await
    }

    async fn get_once(&self, path: &str, params: &[(&str, String)]) -> Result<ClosedPnlResult, ExchangeError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ExchangeError::Internal(e.to_string()))?
            .as_millis()
            .to_string();

        let mut sorted = params.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        let query = serde_urlencoded::to_string(&sorted).unwrap_or_default();
        let signature = self.sign(&timestamp, &query);

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-SIGN", &signature)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .query(&sorted)
            .send()
            .await
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(crate::error::classify_http_error(status.as_u16(), None, &body));
        }

        let parsed: ClosedPnlResponse =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Internal(format!("bad JSON from Bybit: {e}")))?;

        if parsed.ret_code != 0 {
            return Err(classify_bybit_error(parsed.ret_code, &parsed.ret_msg));
        }

        Ok(parsed.result)
    }

    async fn fetch_window(&self, start: i64, end: i64) -> Vec<ClosedPnlRecord> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![
                ("category".to_string(), "linear".to_string()),
                ("startTime".to_string(), start.to_string()),
                ("endTime".to_string(), end.to_string()),
                ("limit".to_string(), PAGE_LIMIT.to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor".to_string(), c.clone()));
            }
            let params_ref: Vec<(&str, String)> = params.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

            match self.get("/v5/position/closed-pnl", &params_ref).await {
                Ok(result) => {
                    let page_len = result.list.len();
                    records.extend(result.list);
                    cursor = result.next_page_cursor.filter(|c| !c.is_empty());
                    if cursor.is_none() || page_len < PAGE_LIMIT as usize {
                        break;
                    }
                }
                Err(e) => {
                    warn!("error fetching Bybit closed PnL window {start}-{end}: {e}");
                    break;
                }
            }
        }

        records
    }
}

fn classify_bybit_error(ret_code: i64, msg: &str) -> ExchangeError {
    match ret_code {
        10003 | 10004 => ExchangeError::AuthError(msg.to_string()),
        10002 => ExchangeError::ClockSkew(msg.to_string()),
        10018 | 10006 => ExchangeError::RateLimited(msg.to_string()),
        _ => ExchangeError::Internal(format!("Bybit retCode {ret_code}: {msg}")),
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn validate_credentials(&self) -> Result<bool, ExchangeError> {
        self.get(
            "/v5/position/closed-pnl",
            &[("category".to_string(), "linear".to_string()), ("limit".to_string(), "1".to_string())],
        )
        .await?;
        Ok(true)
    }

    async fn fetch_trade_history(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogicalTrade>, ExchangeError> {
        let end_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let start_time = since.map(|t| t.timestamp_millis()).unwrap_or(end_time - LOOKBACK_MS);

        let mut all_records = Vec::new();
        let mut current_end = end_time;
        while current_end > start_time {
            let current_start = (current_end - SEVEN_DAYS_MS).max(start_time);
            all_records.extend(self.fetch_window(current_start, current_end).await);
            current_end = current_start;
        }

        Ok(all_records.into_iter().filter_map(to_logical_trade).collect())
    }
}

fn to_logical_trade(record: ClosedPnlRecord) -> Option<LogicalTrade> {
    let entry_price: f64 = record.avg_entry_price.parse().unwrap_or(0.0);
    let exit_price: f64 = record.avg_exit_price.parse().unwrap_or(0.0);
    let qty: f64 = record.qty.parse().unwrap_or(0.0);

    if entry_price == 0.0 || qty == 0.0 {
        return None;
    }

    let pnl_usd: f64 = record.closed_pnl.parse().unwrap_or(0.0);
    let leverage: f64 = record.leverage.parse().unwrap_or(1.0);
    let cum_entry: f64 = record.cum_entry_value.parse().unwrap_or(0.0);
    let cum_exit: f64 = record.cum_exit_value.parse().unwrap_or(0.0);
    let fees = (cum_entry + cum_exit) * FLAT_FEE_RATE;

    let side = match record.side.to_ascii_uppercase().as_str() {
        "BUY" => Side::Buy,
        _ => Side::Sell,
    };

    let created: i64 = record.created_time.parse().unwrap_or(0);
    let updated: i64 = record.updated_time.parse().unwrap_or(created);

    Some(LogicalTrade {
        raw_symbol: record.symbol,
        side,
        entry_price,
        exit_price,
        quantity: qty,
        realized_pnl: pnl_usd,
        fees,
        entry_time: millis_to_datetime(created),
        exit_time: millis_to_datetime(updated),
        leverage: Some(leverage),
        exchange_trade_id: if record.order_id.is_empty() {
            format!("{created}_{}", record.symbol)
        } else {
            record.order_id
        },
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(symbol: &str, side: &str, entry: &str, exit: &str, qty: &str, pnl: &str, lev: &str) -> ClosedPnlRecord {
        ClosedPnlRecord {
            symbol: symbol.into(),
            side: side.into(),
            avg_entry_price: entry.into(),
            avg_exit_price: exit.into(),
            qty: qty.into(),
            closed_pnl: pnl.into(),
            leverage: lev.into(),
            cum_entry_value: "1000".into(),
            cum_exit_value: "1020".into(),
            created_time: "1000".into(),
            updated_time: "2000".into(),
            order_id: "abc123".into(),
        }
    }

    #[test]
    fn scenario_4_bybit_passthrough_with_native_leverage() {
        let rec = record("BTCUSDT", "Sell", "30000", "29400", "0.2", "-100", "5");
        let trade = to_logical_trade(rec).unwrap();
        assert_eq!(trade.leverage, Some(5.0));
        assert_eq!(trade.entry_price, 30000.0);
        assert_eq!(trade.realized_pnl, -100.0);
        let expected_fees = (1000.0 + 1020.0) * FLAT_FEE_RATE;
        assert!((trade.fees - expected_fees).abs() < 1e-9);
    }

    #[test]
    fn zero_entry_price_record_is_dropped() {
        let rec = record("ETHUSDT", "Buy", "0", "0", "0", "0", "1");
        assert!(to_logical_trade(rec).is_none());
    }

    #[test]
    fn classifies_auth_and_rate_limit_codes() {
        assert!(matches!(classify_bybit_error(10003, "bad key"), ExchangeError::AuthError(_)));
        assert!(matches!(classify_bybit_error(10006, "slow down"), ExchangeError::RateLimited(_)));
    }
}
