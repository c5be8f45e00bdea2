//! Cache backend selection when Redis cannot be reached.

use market_relay::cache::{DistributedCache, MarketCache};
use market_relay::config::{Config, RedisSettings};
use market_relay::error::CacheError;
use serde_json::json;
use std::time::Duration;

fn unreachable_redis() -> RedisSettings {
    RedisSettings {
        host: "127.0.0.1".to_string(),
        port: 1,
        connect_timeout_ms: 500,
        ..RedisSettings::default()
    }
}

#[tokio::test]
async fn test_distributed_cache_unreachable() {
    let err = DistributedCache::connect(&unreachable_redis(), Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Unavailable(_)));
}

#[tokio::test]
async fn test_select_falls_back_to_local() {
    let mut config = Config::test_default();
    config.cache.use_redis = true;
    config.redis = unreachable_redis();

    let cache = MarketCache::select(&config).await;
    assert!(!cache.is_distributed());
    assert_eq!(cache.kind(), "local");

    cache.set("ticker:BTC/USDT", json!({"price": 1.0})).await;
    assert_eq!(cache.get("ticker:BTC/USDT").await, Some(json!({"price": 1.0})));
}

#[tokio::test]
async fn test_select_local_when_redis_disabled() {
    let cache = MarketCache::select(&Config::test_default()).await;
    assert!(!cache.is_distributed());
    assert_eq!(cache.get("missing").await, None);
}
