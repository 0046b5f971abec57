use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four supported exchanges. Each variant drives which `ExchangeClient`
/// implementation the orchestrator dispatches to (see `exchanges::for_tag`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Blofin,
    Hyperliquid,
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Blofin => "blofin",
            Exchange::Hyperliquid => "hyperliquid",
        })
    }
}

impl FromStr for Exchange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "bybit" => Ok(Exchange::Bybit),
            "blofin" => Ok(Exchange::Blofin),
            "hyperliquid" => Ok(Exchange::Hyperliquid),
            other => anyhow::bail!("unknown exchange tag: {other}"),
        }
    }
}

/// Status of a connection's most recent sync job.
///
///   pending ──(trigger)──▶ in_progress ──(ok)──▶ success
///                              │
///                              └──(err)──▶ failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

/// Encrypted credential triple as stored at rest. For Hyperliquid, `key`
/// holds the wallet address and `secret`/`passphrase` are unused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedCredentials {
    pub key: String,
    pub secret: String,
    pub passphrase: Option<String>,
}

/// One per (user, exchange). Owned exclusively by the sync job currently
/// operating on it; mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConnection {
    pub id: uuid::Uuid,
    pub user_id: uuid::Uuid,
    pub exchange: Exchange,
    pub credentials: EncryptedCredentials,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_status: SyncStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExchangeConnection {
    pub fn new(
        user_id: uuid::Uuid,
        exchange: Exchange,
        credentials: EncryptedCredentials,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            user_id,
            exchange,
            credentials,
            last_sync_time: None,
            last_sync_status: SyncStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

/// Truncate an error message to the bounded length the store persists
/// (spec: `last_error` is a bounded string, truncated to 500 chars).
pub fn truncate_error(msg: &str, max_len: usize) -> String {
    if msg.len() <= max_len {
        msg.to_string()
    } else {
        let mut truncated: String = msg.chars().take(max_len).collect();
        truncated.push('\u{2026}');
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_display_roundtrip() {
        for ex in [
            Exchange::Binance,
            Exchange::Bybit,
            Exchange::Blofin,
            Exchange::Hyperliquid,
        ] {
            let s = ex.to_string();
            assert_eq!(Exchange::from_str(&s).unwrap(), ex);
        }
    }

    #[test]
    fn truncate_error_respects_bound() {
        let long = "x".repeat(600);
        let truncated = truncate_error(&long, 500);
        assert_eq!(truncated.chars().count(), 501); // 500 + ellipsis
    }

    #[test]
    fn truncate_error_passthrough_when_short() {
        assert_eq!(truncate_error("boom", 500), "boom");
    }
}
