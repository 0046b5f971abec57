use serde::{Deserialize, Serialize};

/// Process-wide configuration (C7). Grounded on the teacher's
/// `Config::load_or_default`/`validate` shape — `.env` loading, environment
/// overrides falling back to sane defaults, and a `validate()` pass the CLI
/// entrypoint runs before starting the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub binance: ExchangeEndpoints,
    pub bybit: ExchangeEndpoints,
    pub blofin: ExchangeEndpoints,
    pub hyperliquid: ExchangeEndpoints,
    pub sync: SyncConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeEndpoints {
    pub base_url: String,
}

/// Scheduler cadence (spec §4.6): a 24h interval between full syncs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub interval_hours: u64,
    pub max_concurrent_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            max_concurrent_connections: 8,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binance: ExchangeEndpoints {
                base_url: "https://fapi.binance.com".into(),
            },
            bybit: ExchangeEndpoints {
                base_url: "https://api.bybit.com".into(),
            },
            blofin: ExchangeEndpoints {
                base_url: "https://openapi.blofin.com".into(),
            },
            hyperliquid: ExchangeEndpoints {
                base_url: "https://api.hyperliquid.xyz".into(),
            },
            sync: SyncConfig::default(),
            telemetry: TelemetryConfig {
                log_level: "info".into(),
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables (`.env` file) with
    /// defaults.
    ///
    /// Required env vars:
    ///   ENCRYPTION_KEY — base64 AES-256 key for the credential cipher
    ///
    /// Optional env vars:
    ///   BINANCE_BASE_URL, BYBIT_BASE_URL, BLOFIN_BASE_URL, HYPERLIQUID_BASE_URL
    ///   SYNC_INTERVAL_HOURS — default 24
    ///   SYNC_MAX_CONCURRENT — default 8
    ///   RUST_LOG — log level (default: info)
    pub fn load_or_default() -> Self {
        let _ = dotenv::dotenv();

        let mut config = Self::default();

        if let Ok(url) = std::env::var("BINANCE_BASE_URL") {
            if !url.is_empty() {
                config.binance.base_url = url;
            }
        }
        if let Ok(url) = std::env::var("BYBIT_BASE_URL") {
            if !url.is_empty() {
                config.bybit.base_url = url;
            }
        }
        if let Ok(url) = std::env::var("BLOFIN_BASE_URL") {
            if !url.is_empty() {
                config.blofin.base_url = url;
            }
        }
        if let Ok(url) = std::env::var("HYPERLIQUID_BASE_URL") {
            if !url.is_empty() {
                config.hyperliquid.base_url = url;
            }
        }

        if let Ok(hours) = std::env::var("SYNC_INTERVAL_HOURS") {
            config.sync.interval_hours = hours.parse().unwrap_or(config.sync.interval_hours);
        }
        if let Ok(max) = std::env::var("SYNC_MAX_CONCURRENT") {
            config.sync.max_concurrent_connections = max.parse().unwrap_or(config.sync.max_concurrent_connections);
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.telemetry.log_level = level;
        }

        config
    }

    /// Fatal checks run once at boot, before the scheduler starts: an
    /// absent or malformed `ENCRYPTION_KEY` must abort the process rather
    /// than silently run with unencrypted credentials.
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::crypto::Cipher::from_env()?;
        anyhow::ensure!(self.sync.interval_hours > 0, "sync.interval_hours must be positive");
        anyhow::ensure!(
            self.sync.max_concurrent_connections > 0,
            "sync.max_concurrent_connections must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_production_endpoints() {
        let config = Config::default();
        assert_eq!(config.binance.base_url, "https://fapi.binance.com");
        assert_eq!(config.sync.interval_hours, 24);
    }
}
