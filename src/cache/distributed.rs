//! Redis-backed cache shared across processes.
//!
//! Expiry is delegated to Redis (`SETEX`). Read failures are reported as
//! misses and write failures are dropped, so a flaky Redis never breaks the
//! caller. Only construction can fail, with `CacheError::Unavailable`.

use crate::config::RedisSettings;
use crate::error::CacheError;
use crate::utils::redis_url;
use log::{debug, error, info, warn};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Uses a `ConnectionManager` for automatic reconnection after construction.
#[derive(Clone)]
pub struct DistributedCache {
    conn_manager: ConnectionManager,
    ttl: Duration,
    endpoint: String,
}

impl fmt::Debug for DistributedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedCache")
            .field("endpoint", &self.endpoint)
            .field("ttl", &self.ttl)
            .field("conn_manager", &"<ConnectionManager instance>")
            .finish()
    }
}

impl DistributedCache {
    pub async fn connect(settings: &RedisSettings, ttl: Duration) -> Result<Self, CacheError> {
        let url = redis_url(settings)
            .map_err(|e| CacheError::Unavailable(format!("invalid Redis address: {}", e)))?;
        let endpoint = format!("{}:{}/{}", settings.host, settings.port, settings.db);
        Self::connect_url(&url, &endpoint, ttl, settings.connect_timeout()).await
    }

    /// Connects and pings Redis, failing fast if it is not reachable within
    /// `connect_timeout`.
    pub async fn connect_url(
        url: &str,
        endpoint: &str,
        ttl: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, CacheError> {
        info!("Initializing Redis cache for {}", endpoint);
        let unavailable =
            |reason: String| CacheError::Unavailable(format!("Redis at {}: {}", endpoint, reason));

        let client = redis::Client::open(url).map_err(|e| unavailable(e.to_string()))?;
        let mut conn_manager =
            match tokio::time::timeout(connect_timeout, ConnectionManager::new(client)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    error!("Failed to create Redis ConnectionManager: {}", e);
                    return Err(unavailable(e.to_string()));
                }
                Err(_) => return Err(unavailable("connection timed out".to_string())),
            };

        let ping = redis::cmd("PING");
        let pong = ping.query_async::<_, String>(&mut conn_manager);
        match tokio::time::timeout(connect_timeout, pong).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(unavailable(format!("PING failed: {}", e))),
            Err(_) => return Err(unavailable("PING timed out".to_string())),
        }

        info!("Redis cache ready at {}. TTL: {:?}", endpoint, ttl);
        Ok(Self {
            conn_manager,
            ttl,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get_json(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("{}; treating as miss", e);
                None
            }
        }
    }

    async fn try_get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let raw = conn
            .get::<_, Option<String>>(key)
            .await
            .map_err(|e| CacheError::ReadFailed(format!("GET {}: {}", key, e)))?;
        match raw {
            Some(value_str) => {
                debug!("Cache HIT for key: {}", key);
                serde_json::from_str::<T>(&value_str)
                    .map(Some)
                    .map_err(|e| CacheError::ReadFailed(format!("decode {}: {}", key, e)))
            }
            None => {
                debug!("Cache MISS for key: {}", key);
                Ok(None)
            }
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = self.try_set_json(key, value).await {
            warn!("{}; write dropped", e);
        }
    }

    async fn try_set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let value_str = serde_json::to_string(value)
            .map_err(|e| CacheError::WriteFailed(format!("encode {}: {}", key, e)))?;
        // SETEX takes whole seconds.
        let ttl_secs = self.ttl.as_secs().max(1);
        let mut conn = self.conn_manager.clone();
        conn.set_ex::<_, _, ()>(key, value_str, ttl_secs)
            .await
            .map_err(|e| CacheError::WriteFailed(format!("SETEX {}: {}", key, e)))?;
        debug!("Cache SETEX success for key: {} with TTL: {}s", key, ttl_secs);
        Ok(())
    }

    /// Same no-single-flight caveat as `TtlCache::get_or_set`.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, factory: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(cached) = self.get_json::<T>(key).await {
            return cached;
        }
        let value = factory().await;
        self.set_json(key, &value).await;
        value
    }

    pub async fn try_get_or_set<T, E, F, Fut>(&self, key: &str, factory: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get_json::<T>(key).await {
            return Ok(cached);
        }
        let value = factory().await?;
        self.set_json(key, &value).await;
        Ok(value)
    }
}
