use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failures inside the cache layer.
///
/// Only `Unavailable` ever crosses a cache boundary: it is returned by
/// `DistributedCache::connect` so the selector can fall back to the local
/// cache. Read and write failures are logged and swallowed inside the cache.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Backing store unreachable at construction time
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache read failed: {0}")]
    ReadFailed(String),

    #[error("Cache write failed: {0}")]
    WriteFailed(String),
}

/// Errors surfaced to callers of `RequestBroker::publish_request` and
/// `WorkerLoop::start_worker`.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// No matching response arrived before the deadline
    #[error("Request {id} timed out after {}s", .timeout.as_secs_f64())]
    Timeout { id: Uuid, timeout: Duration },

    /// Worker-reported failure, message passed through verbatim
    #[error("{0}")]
    Remote(String),

    /// Connect, subscribe or publish failure on the shared channel
    #[error("Transport Error: {0}")]
    Transport(String),

    /// Payload that could not be encoded or decoded as an envelope
    #[error("Malformed Message: {0}")]
    Malformed(String),
}

impl BrokerError {
    /// Whether the caller may reasonably retry the same request.
    ///
    /// The broker itself never retries; this only informs caller policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Timeout { .. } => true,
            BrokerError::Transport(_) => true,
            BrokerError::Remote(_) => false,
            BrokerError::Malformed(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout { .. })
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Transport(format!("Redis error: {}", err))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Malformed(format!("JSON error: {}", err))
    }
}

/// Outcome of a failed tool invocation.
///
/// `Display` prints the bare message: it is what travels in the `error`
/// field of a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// Transient failure, the same call may succeed later
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure for these arguments
    #[error("{0}")]
    Fatal(String),
}

impl ToolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ToolError::Retryable(msg) | ToolError::Fatal(msg) => msg,
        }
    }
}

pub type ToolResult = Result<serde_json::Value, ToolError>;

/// Errors raised while talking to the upstream exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// Upstream API unavailable or failing
    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    InvalidSymbol(String),

    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("Unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),
}

impl ExchangeError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExchangeError::Unavailable(_))
    }
}

impl From<ExchangeError> for ToolError {
    fn from(err: ExchangeError) -> Self {
        if err.is_recoverable() {
            ToolError::Retryable(err.to_string())
        } else {
            ToolError::Fatal(err.to_string())
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::Unavailable(format!("HTTP error: {}", err))
    }
}

/// Invalid or missing configuration.
#[derive(Debug, Clone, Error)]
#[error("Config Error: {0}")]
pub struct ConfigError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_carries_id_and_duration() {
        let id = Uuid::new_v4();
        let err = BrokerError::Timeout {
            id,
            timeout: Duration::from_millis(1500),
        };
        let msg = err.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("timed out after 1.5s"));
        assert!(err.is_retryable());
        assert!(err.is_timeout());
    }

    #[test]
    fn test_remote_error_is_verbatim() {
        let err = BrokerError::Remote("Handler error".to_string());
        assert_eq!(err.to_string(), "Handler error");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_exchange_error_classification() {
        let transient: ToolError = ExchangeError::Unavailable("502".into()).into();
        assert!(transient.is_retryable());
        assert_eq!(transient.message(), "Exchange unavailable: 502");

        let permanent: ToolError = ExchangeError::InvalidSymbol("Symbol not found on binance: FOO/BAR".into()).into();
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.to_string(), "Symbol not found on binance: FOO/BAR");
    }
}
