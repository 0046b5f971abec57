use thiserror::Error;

/// Typed failure modes at the exchange-client/normalizer seam (spec §7).
/// Everything above this seam (orchestrator, CLI, config) propagates
/// `anyhow::Error` instead — callers here need to match on *kind*
/// (to decide retry vs. surface vs. drop), callers above just need a
/// message.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("authentication failed: {0}")]
    AuthError(String),

    #[error("clock skew detected: {0}")]
    ClockSkew(String),

    #[error("insufficient API key permissions: {remediation}")]
    PermissionError { remediation: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("record failed validation: {0}")]
    ValidationError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExchangeError {
    /// Whether this failure is worth retrying with backoff (spec §7:
    /// RATE_LIMITED and NETWORK_ERROR get up to 3 retries; everything
    /// else propagates immediately).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::RateLimited(_) | ExchangeError::NetworkError(_))
    }

    /// User-facing remediation string (spec §7's "Surface to user with
    /// exchange-specific remediation").
    pub fn remediation(&self) -> Option<String> {
        match self {
            ExchangeError::AuthError(_) => {
                Some("Check that the API key and secret are correct and active.".into())
            }
            ExchangeError::ClockSkew(_) => {
                Some("Your system clock appears skewed — sync it with NTP and retry.".into())
            }
            ExchangeError::PermissionError { remediation } => Some(remediation.clone()),
            _ => None,
        }
    }
}

/// Classify an HTTP status + exchange-specific error code into the common
/// taxonomy of spec §4.1/§7. Each exchange client calls this with its own
/// code after a non-2xx response.
pub fn classify_http_error(status: u16, exchange_code: Option<&str>, body: &str) -> ExchangeError {
    match (status, exchange_code) {
        (401, _) | (403, _) => ExchangeError::AuthError(body.to_string()),
        (_, Some("-2015")) | (_, Some("10003")) | (_, Some("10004")) => {
            ExchangeError::AuthError(body.to_string())
        }
        (_, Some("152404")) | (_, Some("152409")) => ExchangeError::PermissionError {
            remediation: "Enable read/trade permission scope for this API key on the exchange.".into(),
        },
        (_, Some("-1021")) | (_, Some("10002")) => ExchangeError::ClockSkew(body.to_string()),
        (429, _) => ExchangeError::RateLimited(body.to_string()),
        (500..=599, _) => ExchangeError::NetworkError(body.to_string()),
        _ => ExchangeError::Internal(format!("HTTP {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ExchangeError::RateLimited("x".into()).is_retryable());
        assert!(ExchangeError::NetworkError("x".into()).is_retryable());
        assert!(!ExchangeError::AuthError("x".into()).is_retryable());
    }

    #[test]
    fn classify_auth_codes() {
        assert!(matches!(
            classify_http_error(401, None, "nope"),
            ExchangeError::AuthError(_)
        ));
        assert!(matches!(
            classify_http_error(400, Some("-2015"), "bad key"),
            ExchangeError::AuthError(_)
        ));
    }

    #[test]
    fn classify_blofin_permission_code() {
        assert!(matches!(
            classify_http_error(400, Some("152404"), "scope"),
            ExchangeError::PermissionError { .. }
        ));
    }

    #[test]
    fn classify_rate_limit() {
        assert!(matches!(
            classify_http_error(429, None, "slow down"),
            ExchangeError::RateLimited(_)
        ));
    }
}
