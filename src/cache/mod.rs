//! Caching layer for upstream market data.

pub mod distributed;
pub mod selector;
pub mod ttl;

pub use distributed::DistributedCache;
pub use selector::MarketCache;
pub use ttl::TtlCache;

/// Joins a prefix and its parameters with `:` (e.g. `ohlcv:BTC/USDT:1h`).
pub fn cache_key(prefix: &str, params: &[&str]) -> String {
    let mut key = prefix.to_string();
    for param in params {
        key.push(':');
        key.push_str(param);
    }
    key
}
