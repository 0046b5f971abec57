//! Blofin perpetual-futures client + fill aggregator.
//!
//! Grounded on `original_source/backend/app/services/blofin_client.py`:
//! `_sign` (base64(hex(HMAC)) over `path+method+timestamp+nonce+body`),
//! `fetch_trade_history` (100-page-size `after`-cursor pagination capped at
//! 10000 pages), `fetch_contract_sizes`/`fetch_leverage_map`, and
//! `aggregate_fills_by_order` (exit-run/entry-run grouping identical in
//! shape to Binance's, but contract-size-scaled). `match_entry_exit_pairs`
//! (from `original_source/backend/app/routes/blofin_sync.py`) is kept as a
//! second, sequentially-applied repair pass over the aggregator's output —
//! see the Open Question note in the design doc.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

use super::{default_http_client, ExchangeClient};
use crate::error::{classify_http_error, ExchangeError};
use crate::models::trade::{LogicalTrade, Side};

const PAGE_LIMIT: u32 = 100;
const MAX_PAGES: u32 = 10_000;

pub struct BlofinClient {
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    passphrase: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: serde_json::Value,
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "contractValue")]
    contract_value: String,
}

#[derive(Debug, Deserialize)]
struct LeverageEntry {
    #[serde(rename = "instId")]
    inst_id: String,
    lever: String,
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    #[serde(rename = "instId")]
    inst_id: String,
    lever: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Fill {
    #[serde(rename = "tradeId")]
    trade_id: String,
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "instId")]
    inst_id: String,
    side: String,
    #[serde(rename = "fillPrice")]
    fill_price: String,
    #[serde(rename = "fillSize")]
    fill_size: String,
    #[serde(rename = "fillPnl")]
    fill_pnl: String,
    fee: String,
    #[serde(default)]
    lever: Option<String>,
    ts: String,
}

impl BlofinClient {
    pub fn new(api_key: String, api_secret: String, passphrase: String) -> Self {
        Self {
            http: default_http_client(),
            api_key,
            api_secret,
            passphrase,
            base_url: "https://openapi.blofin.com".to_string(),
        }
    }

    fn sign(&self, method: &str, path_with_query: &str, timestamp: &str, nonce: &str, body: &str) -> String {
        use base64::Engine;
        let prehash = format!("{path_with_query}{method}{timestamp}{nonce}{body}");
        let hex_sig = super::hmac_sha256_hex(&self.api_secret, &prehash);
        base64::engine::general_purpose::STANDARD.encode(hex_sig.as_bytes())
    }

    async fn request(&self, method: &str, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value, ExchangeError> {
        super::with_retry(|| self.request_once(method, path, query)).await
    }

    async fn request_once(&self, method: &str, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value, ExchangeError> {
        let query_string = serde_urlencoded::to_string(query).unwrap_or_default();
        let path_with_query = if query_string.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query_string}")
        };
        let url = format!("{}{}", self.base_url, path_with_query);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ExchangeError::Internal(e.to_string()))?
            .as_millis()
            .to_string();
        let nonce = Uuid::new_v4().to_string();
        let signature = self.sign(method, &path_with_query, &timestamp, &nonce, "");

        let resp = self
            .http
            .request(method.parse().unwrap_or(reqwest::Method::GET), &url)
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-NONCE", nonce)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .send()
            .await
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), None, &body));
        }

        let envelope: Envelope<serde_json::Value> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Internal(format!("bad JSON from Blofin: {e}")))?;

        let code_is_zero = matches!(&envelope.code, serde_json::Value::Number(n) if n.as_i64() == Some(0))
            || matches!(&envelope.code, serde_json::Value::String(s) if s == "0");
        if !code_is_zero {
            let code_str = envelope.code.to_string();
            return Err(classify_blofin_code(&code_str, envelope.msg.as_deref().unwrap_or("")));
        }

        Ok(envelope.data.unwrap_or(serde_json::Value::Null))
    }

    async fn fetch_contract_sizes(&self) -> BTreeMap<String, f64> {
        match self
            .request("GET", "/api/v1/market/instruments", &[("instType", "PERPETUAL".to_string())])
            .await
        {
            Ok(value) => serde_json::from_value::<Vec<Instrument>>(value)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|i| i.contract_value.parse::<f64>().ok().map(|v| (i.inst_id, v)))
                .collect(),
            Err(e) => {
                warn!("failed to fetch Blofin contract sizes: {e}");
                BTreeMap::new()
            }
        }
    }

    async fn fetch_leverage_map(&self) -> BTreeMap<String, f64> {
        match self
            .request("GET", "/api/v1/account/batch-leverage-info", &[("mgnMode", "cross".to_string())])
            .await
        {
            Ok(value) => {
                let entries: Vec<LeverageEntry> = serde_json::from_value(value).unwrap_or_default();
                if !entries.is_empty() {
                    return entries
                        .into_iter()
                        .filter_map(|e| e.lever.parse::<f64>().ok().map(|lev| (e.inst_id, lev)))
                        .collect();
                }
            }
            Err(e) => warn!("batch-leverage-info failed, trying positions endpoint: {e}"),
        }

        match self.request("GET", "/api/v1/account/positions", &[]).await {
            Ok(value) => serde_json::from_value::<Vec<PositionEntry>>(value)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|p| p.lever.parse::<f64>().ok().map(|lev| (p.inst_id, lev)))
                .collect(),
            Err(e) => {
                warn!("failed to fetch Blofin leverage settings: {e}");
                BTreeMap::new()
            }
        }
    }

    async fn fetch_fills(&self, begin: Option<i64>, end: Option<i64>) -> Vec<Fill> {
        let mut fills = Vec::new();
        let mut after: Option<String> = None;
        let mut page_count = 0u32;

        while page_count < MAX_PAGES {
            let mut query = vec![("limit", PAGE_LIMIT.to_string())];
            if let Some(b) = begin {
                query.push(("begin", b.to_string()));
            }
            if let Some(e) = end {
                query.push(("end", e.to_string()));
            }
            if let Some(a) = &after {
                query.push(("after", a.clone()));
            }

            match self.request("GET", "/api/v1/trade/fills-history", &query).await {
                Ok(value) => {
                    let page: Vec<Fill> = serde_json::from_value(value).unwrap_or_default();
                    if page.is_empty() {
                        break;
                    }
                    let page_len = page.len();
                    after = page.last().map(|f| f.trade_id.clone());
                    fills.extend(page);
                    page_count += 1;
                    if page_len < PAGE_LIMIT as usize {
                        break;
                    }
                }
                Err(e) => {
                    warn!("error fetching Blofin fills-history page {page_count}: {e}");
                    break;
                }
            }
        }

        if page_count >= MAX_PAGES {
            warn!("reached Blofin fills-history page cap ({MAX_PAGES}); some history may be missing");
        }

        fills
    }
}

fn classify_blofin_code(code: &str, msg: &str) -> ExchangeError {
    match code {
        "\"152404\"" | "152404" | "\"152409\"" | "152409" => ExchangeError::PermissionError {
            remediation: "Enable read/trade permission scope for this API key on Blofin.".into(),
        },
        "\"152401\"" | "152401" => ExchangeError::AuthError(msg.to_string()),
        _ => ExchangeError::Internal(format!("Blofin code {code}: {msg}")),
    }
}

#[async_trait]
impl ExchangeClient for BlofinClient {
    async fn validate_credentials(&self) -> Result<bool, ExchangeError> {
        self.request("GET", "/api/v1/account/positions", &[]).await?;
        Ok(true)
    }

    async fn fetch_trade_history(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogicalTrade>, ExchangeError> {
        let begin = since.map(|t| t.timestamp_millis());
        let fills = self.fetch_fills(begin, None).await;

        let contract_sizes = self.fetch_contract_sizes().await;
        let leverage_map = self.fetch_leverage_map().await;

        let aggregated = aggregate_fills_by_order(fills, &contract_sizes, &leverage_map);
        Ok(match_entry_exit_pairs(aggregated))
    }
}

fn pnl_of(f: &Fill) -> f64 {
    f.fill_pnl.parse().unwrap_or(0.0)
}

fn contract_size_for(symbol: &str, sizes: &BTreeMap<String, f64>) -> f64 {
    if let Some(v) = sizes.get(symbol) {
        return *v;
    }
    if symbol.starts_with("BTC") {
        0.001
    } else if symbol.starts_with("ETH") {
        0.01
    } else {
        0.01
    }
}

/// Group fills into positions (exit-run then entry-run per symbol,
/// newest-first) and scale contract counts into coin quantity.
fn aggregate_fills_by_order(
    fills: Vec<Fill>,
    contract_sizes: &BTreeMap<String, f64>,
    leverage_map: &BTreeMap<String, f64>,
) -> Vec<LogicalTrade> {
    let mut by_symbol: BTreeMap<String, Vec<Fill>> = BTreeMap::new();
    for fill in fills {
        by_symbol.entry(fill.inst_id.clone()).or_default().push(fill);
    }

    let mut out = Vec::new();

    for (symbol, mut symbol_fills) in by_symbol {
        symbol_fills.sort_by_key(|f| std::cmp::Reverse(f.ts.parse::<i64>().unwrap_or(0)));

        let mut i = 0;
        while i < symbol_fills.len() {
            let mut position_fills = Vec::new();

            while i < symbol_fills.len() && pnl_of(&symbol_fills[i]) != 0.0 {
                position_fills.push(symbol_fills[i].clone());
                i += 1;
            }
            while i < symbol_fills.len() && pnl_of(&symbol_fills[i]) == 0.0 {
                position_fills.push(symbol_fills[i].clone());
                i += 1;
            }

            let has_entry = position_fills.iter().any(|f| pnl_of(f) == 0.0);
            let has_exit = position_fills.iter().any(|f| pnl_of(f) != 0.0);
            if !has_entry || !has_exit || position_fills.is_empty() {
                continue;
            }

            let contract_size = contract_size_for(&symbol, contract_sizes);
            if let Some(logical) = aggregate_position(position_fills, contract_size, leverage_map) {
                out.push(logical);
            }
        }
    }

    out
}

fn aggregate_position(
    position_fills: Vec<Fill>,
    contract_size: f64,
    leverage_map: &BTreeMap<String, f64>,
) -> Option<LogicalTrade> {
    let (entry_fills, exit_fills): (Vec<_>, Vec<_>) = position_fills.iter().cloned().partition(|f| pnl_of(f) == 0.0);

    let total_entry_contracts: f64 = entry_fills.iter().map(|f| f.fill_size.parse::<f64>().unwrap_or(0.0)).sum();
    let avg_entry_price = if total_entry_contracts > 0.0 {
        entry_fills
            .iter()
            .map(|f| f.fill_price.parse::<f64>().unwrap_or(0.0) * f.fill_size.parse::<f64>().unwrap_or(0.0))
            .sum::<f64>()
            / total_entry_contracts
    } else {
        entry_fills.first().and_then(|f| f.fill_price.parse().ok()).unwrap_or(0.0)
    };

    let total_exit_contracts: f64 = exit_fills.iter().map(|f| f.fill_size.parse::<f64>().unwrap_or(0.0)).sum();
    let avg_exit_price = if total_exit_contracts > 0.0 {
        exit_fills
            .iter()
            .map(|f| f.fill_price.parse::<f64>().unwrap_or(0.0) * f.fill_size.parse::<f64>().unwrap_or(0.0))
            .sum::<f64>()
            / total_exit_contracts
    } else {
        exit_fills.first().and_then(|f| f.fill_price.parse().ok()).unwrap_or(0.0)
    };

    let total_pnl: f64 = position_fills.iter().map(pnl_of).sum();
    let total_fees: f64 = position_fills.iter().map(|f| f.fee.parse::<f64>().unwrap_or(0.0)).sum();

    let first_fill = entry_fills.first().or_else(|| position_fills.first())?;
    let symbol = first_fill.inst_id.clone();
    let side = if first_fill.side.eq_ignore_ascii_case("buy") { Side::Buy } else { Side::Sell };

    let entry_ts = entry_fills.first().map(|f| f.ts.parse::<i64>().unwrap_or(0)).unwrap_or_else(|| {
        position_fills.first().map(|f| f.ts.parse::<i64>().unwrap_or(0)).unwrap_or(0)
    });
    let exit_ts = exit_fills.last().map(|f| f.ts.parse::<i64>().unwrap_or(0)).unwrap_or_else(|| {
        position_fills.last().map(|f| f.ts.parse::<i64>().unwrap_or(0)).unwrap_or(0)
    });

    let leverage = leverage_map.get(&symbol).copied().or_else(|| first_fill.lever.as_ref().and_then(|l| l.parse().ok()));

    Some(LogicalTrade {
        raw_symbol: symbol,
        side,
        entry_price: avg_entry_price,
        exit_price: avg_exit_price,
        quantity: total_entry_contracts * contract_size,
        realized_pnl: total_pnl,
        fees: total_fees,
        entry_time: millis_to_datetime(entry_ts),
        exit_time: millis_to_datetime(exit_ts),
        leverage,
        exchange_trade_id: if first_fill.order_id.is_empty() {
            first_fill.trade_id.clone()
        } else {
            first_fill.order_id.clone()
        },
    })
}

/// Second-pass repair for the legacy interleaved layout where consecutive
/// (exit, entry) pairs actually hold the exit leg's *entry_time* in place of
/// its *exit_time* (see the Open Question in the design doc). Swaps
/// entry/exit price and time between the pair and folds the entry leg away.
fn match_entry_exit_pairs(trades: Vec<LogicalTrade>) -> Vec<LogicalTrade> {
    let mut matched = Vec::new();
    let mut i = 0;

    while i < trades.len() {
        let current = &trades[i];

        if current.realized_pnl != 0.0 {
            if i + 1 < trades.len() {
                let next = &trades[i + 1];
                if next.realized_pnl == 0.0 && next.raw_symbol == current.raw_symbol {
                    let mut repaired = current.clone();
                    repaired.exit_time = current.entry_time;
                    repaired.entry_time = next.entry_time;
                    repaired.exit_price = current.entry_price;
                    repaired.entry_price = next.entry_price;
                    matched.push(repaired);
                    i += 2;
                    continue;
                }
            }
            matched.push(current.clone());
            i += 1;
        } else {
            // Entry-only fill with no preceding exit pair: drop, same as the
            // Python route's implicit fallthrough (no `else` branch appends it).
            i += 1;
        }
    }

    matched
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(trade_id: &str, order_id: &str, symbol: &str, side: &str, price: &str, size: &str, pnl: &str, ts: &str) -> Fill {
        Fill {
            trade_id: trade_id.into(),
            order_id: order_id.into(),
            inst_id: symbol.into(),
            side: side.into(),
            fill_price: price.into(),
            fill_size: size.into(),
            fill_pnl: pnl.into(),
            fee: "0.01".into(),
            lever: Some("10".into()),
            ts: ts.into(),
        }
    }

    #[test]
    fn scenario_2_contract_value_conversion() {
        let fills = vec![
            fill("2", "o2", "SOL-USDT", "SELL", "105", "200", "200.0", "2000"),
            fill("1", "o1", "SOL-USDT", "BUY", "100", "200", "0", "1000"),
        ];
        let mut sizes = BTreeMap::new();
        sizes.insert("SOL-USDT".to_string(), 1.0 / 3.0);
        let out = aggregate_fills_by_order(fills, &sizes, &BTreeMap::new());
        assert_eq!(out.len(), 1);
        let t = &out[0];
        assert!((t.quantity - 200.0 * (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn match_entry_exit_pairs_swaps_timestamps_and_prices() {
        let exit_leg = LogicalTrade {
            raw_symbol: "BTC-USDT".into(),
            side: Side::Buy,
            entry_price: 51000.0, // actually the exit price in the legacy layout
            exit_price: 0.0,
            quantity: 0.1,
            realized_pnl: 100.0,
            fees: 1.0,
            entry_time: millis_to_datetime(2_000), // actually the exit time
            exit_time: millis_to_datetime(0),
            leverage: Some(10.0),
            exchange_trade_id: "x".into(),
        };
        let entry_leg = LogicalTrade {
            raw_symbol: "BTC-USDT".into(),
            side: Side::Buy,
            entry_price: 50000.0,
            exit_price: 0.0,
            quantity: 0.1,
            realized_pnl: 0.0,
            fees: 0.0,
            entry_time: millis_to_datetime(1_000),
            exit_time: millis_to_datetime(0),
            leverage: Some(10.0),
            exchange_trade_id: "y".into(),
        };
        let fixed = match_entry_exit_pairs(vec![exit_leg, entry_leg]);
        assert_eq!(fixed.len(), 1);
        assert_eq!(fixed[0].entry_price, 50000.0);
        assert_eq!(fixed[0].exit_price, 51000.0);
        assert_eq!(fixed[0].entry_time, millis_to_datetime(1_000));
        assert_eq!(fixed[0].exit_time, millis_to_datetime(2_000));
    }

    #[test]
    fn unmatched_entry_only_fill_is_dropped() {
        let entry_leg = LogicalTrade {
            raw_symbol: "ETH-USDT".into(),
            side: Side::Buy,
            entry_price: 3000.0,
            exit_price: 0.0,
            quantity: 1.0,
            realized_pnl: 0.0,
            fees: 0.0,
            entry_time: millis_to_datetime(1_000),
            exit_time: millis_to_datetime(0),
            leverage: None,
            exchange_trade_id: "z".into(),
        };
        assert!(match_entry_exit_pairs(vec![entry_leg]).is_empty());
    }
}
