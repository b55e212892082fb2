//! Provider failures, split into transient and permanent kinds.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// HTTP 429
    RateLimited,
    /// 5xx and unknown statuses
    ServerError,
    /// Other 4xx: bad request, auth, missing model
    ClientError,
    /// Connect failures and timeouts
    NetworkError,
    /// Body did not have the expected shape
    ParseError,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::ServerError => "server_error",
            ProviderErrorKind::ClientError => "client_error",
            ProviderErrorKind::NetworkError => "network_error",
            ProviderErrorKind::ParseError => "parse_error",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited | ProviderErrorKind::ServerError | ProviderErrorKind::NetworkError
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an HTTP status onto an error kind.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        429 => ProviderErrorKind::RateLimited,
        400..=499 => ProviderErrorKind::ClientError,
        _ => ProviderErrorKind::ServerError,
    }
}

#[derive(Debug, Clone, Error)]
#[error("provider {kind}{}: {message}", status_suffix(.status_code))]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// Delay requested by the server via `Retry-After`
    pub retry_after: Option<Duration>,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" (HTTP {})", code)).unwrap_or_default()
}

impl ProviderError {
    fn new(kind: ProviderErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
            retry_after: None,
        }
    }

    /// Error for a non-success HTTP response.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let mut error = Self::new(classify_http_status(status), Some(status), body.to_string());
        if error.kind == ProviderErrorKind::RateLimited {
            error.retry_after = retry_after;
        }
        error
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        let mut error = Self::new(ProviderErrorKind::RateLimited, Some(429), message);
        error.retry_after = retry_after;
        error
    }

    pub fn server_error(status_code: u16, message: String) -> Self {
        Self::new(ProviderErrorKind::ServerError, Some(status_code), message)
    }

    pub fn client_error(status_code: u16, message: String) -> Self {
        Self::new(ProviderErrorKind::ClientError, Some(status_code), message)
    }

    pub fn network_error(message: String) -> Self {
        Self::new(ProviderErrorKind::NetworkError, None, message)
    }

    pub fn parse_error(message: String) -> Self {
        Self::new(ProviderErrorKind::ParseError, None, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Transport-level retry policy for a single provider call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Wall-clock budget across all attempts of one call
    pub max_retry_duration: Duration,
    pub rate_limit_base_delay: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(120),
            rate_limit_base_delay: Duration::from_secs(5),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt + 1`, or `None` to give up.
    ///
    /// `Retry-After` wins over exponential backoff; the wait never exceeds
    /// what is left of `max_retry_duration`.
    pub fn next_delay(&self, error: &ProviderError, attempt: u32, elapsed: Duration) -> Option<Duration> {
        if !error.is_transient() || attempt >= self.max_retries {
            return None;
        }
        let backoff = || {
            let base = match error.kind {
                ProviderErrorKind::RateLimited => self.rate_limit_base_delay,
                _ => self.base_delay,
            };
            base.saturating_mul(2u32.saturating_pow(attempt)).min(self.max_delay)
        };
        let delay = error
            .retry_after
            .unwrap_or_else(backoff)
            .min(self.max_retry_duration.saturating_sub(elapsed));
        (!delay.is_zero()).then_some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_classify() {
        assert_eq!(classify_http_status(429), ProviderErrorKind::RateLimited);
        assert_eq!(classify_http_status(503), ProviderErrorKind::ServerError);
        assert_eq!(classify_http_status(401), ProviderErrorKind::ClientError);
        assert!(!ProviderErrorKind::ParseError.is_transient());
        assert!(ProviderErrorKind::NetworkError.is_transient());
    }

    #[test]
    fn display_includes_status() {
        let error = ProviderError::from_status(502, "bad gateway", None);
        assert_eq!(error.to_string(), "provider server_error (HTTP 502): bad gateway");
        let error = ProviderError::parse_error("no choices".to_string());
        assert_eq!(error.to_string(), "provider parse_error: no choices");
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let config = RetryConfig::default();
        let error = ProviderError::client_error(401, "bad key".to_string());
        assert_eq!(config.next_delay(&error, 0, Duration::ZERO), None);
    }

    #[test]
    fn retry_after_wins_and_budget_caps() {
        let config = RetryConfig::default();
        let error = ProviderError::from_status(429, "slow down", Some(Duration::from_secs(30)));
        assert_eq!(config.next_delay(&error, 2, Duration::ZERO), Some(Duration::from_secs(30)));
        assert_eq!(
            config.next_delay(&error, 0, Duration::from_secs(110)),
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.next_delay(&error, 0, Duration::from_secs(120)), None);
        assert_eq!(config.next_delay(&error, 3, Duration::ZERO), None);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = RetryConfig {
            max_retries: 10,
            max_retry_duration: Duration::from_secs(600),
            ..Default::default()
        };
        let error = ProviderError::server_error(500, "boom".to_string());
        assert_eq!(config.next_delay(&error, 0, Duration::ZERO), Some(Duration::from_secs(1)));
        assert_eq!(config.next_delay(&error, 2, Duration::ZERO), Some(Duration::from_secs(4)));
        assert_eq!(config.next_delay(&error, 9, Duration::ZERO), Some(Duration::from_secs(60)));
    }
}
