use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
}

impl RedisSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            connect_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub use_redis: bool,
    pub ttl_secs: u64,
    pub max_size: usize,
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            use_redis: true,
            ttl_secs: 10,
            max_size: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubSettings {
    pub request_channel: String,
    pub response_channel: String,
    pub request_timeout_secs: u64,
    pub max_in_flight: usize,
}

impl PubSubSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            request_channel: "crypto_mcp:requests".to_string(),
            response_channel: "crypto_mcp:responses".to_string(),
            request_timeout_secs: 30,
            max_in_flight: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSettings {
    pub name: String,
    pub base_url: String,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            name: "binance".to_string(),
            base_url: "https://api.binance.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub redis: RedisSettings,
    pub cache: CacheSettings,
    pub pubsub: PubSubSettings,
    pub exchange: ExchangeSettings,
    pub log_level: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::test_default();
        Config {
            redis: RedisSettings {
                host: env::var("REDIS_HOST").unwrap_or(defaults.redis.host),
                port: env_or("REDIS_PORT", defaults.redis.port),
                db: env_or("REDIS_DB", defaults.redis.db),
                password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
                connect_timeout_ms: env_or(
                    "REDIS_CONNECT_TIMEOUT_MS",
                    defaults.redis.connect_timeout_ms,
                ),
            },
            cache: CacheSettings {
                use_redis: env_flag("USE_REDIS_CACHE", CacheSettings::default().use_redis),
                ttl_secs: env_or("CACHE_TTL", defaults.cache.ttl_secs),
                max_size: env_or("CACHE_MAXSIZE", defaults.cache.max_size),
            },
            pubsub: PubSubSettings {
                request_channel: env::var("REQUEST_CHANNEL")
                    .unwrap_or(defaults.pubsub.request_channel),
                response_channel: env::var("RESPONSE_CHANNEL")
                    .unwrap_or(defaults.pubsub.response_channel),
                request_timeout_secs: env_or(
                    "REQUEST_TIMEOUT_SECS",
                    defaults.pubsub.request_timeout_secs,
                ),
                max_in_flight: env_or("WORKER_MAX_IN_FLIGHT", defaults.pubsub.max_in_flight),
            },
            exchange: ExchangeSettings {
                name: env::var("EXCHANGE_NAME").unwrap_or(defaults.exchange.name),
                base_url: env::var("EXCHANGE_BASE_URL").unwrap_or(defaults.exchange.base_url),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    /// Defaults without reading the environment, except that the cache is
    /// always in-process.
    pub fn test_default() -> Self {
        Config {
            cache: CacheSettings {
                use_redis: false,
                ..CacheSettings::default()
            },
            log_level: "info".to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.ttl_secs == 0 {
            return Err(ConfigError("CACHE_TTL must be positive".to_string()));
        }
        if self.cache.max_size == 0 {
            return Err(ConfigError("CACHE_MAXSIZE must be positive".to_string()));
        }
        if self.pubsub.request_channel.is_empty() || self.pubsub.response_channel.is_empty() {
            return Err(ConfigError("pub/sub channel names cannot be empty".to_string()));
        }
        if self.pubsub.request_channel == self.pubsub.response_channel {
            return Err(ConfigError(
                "REQUEST_CHANNEL and RESPONSE_CHANNEL must differ".to_string(),
            ));
        }
        if self.pubsub.request_timeout_secs == 0 {
            return Err(ConfigError("REQUEST_TIMEOUT_SECS must be positive".to_string()));
        }
        if self.pubsub.max_in_flight == 0 {
            return Err(ConfigError("WORKER_MAX_IN_FLIGHT must be positive".to_string()));
        }
        if self.redis.host.is_empty() {
            return Err(ConfigError("REDIS_HOST cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn log_settings(&self) {
        // Password is never logged.
        log::info!(
            "Configuration loaded: redis={}:{}/{} cache(use_redis={}, ttl={}s, max_size={}) channels({} -> {}) exchange={}",
            self.redis.host,
            self.redis.port,
            self.redis.db,
            self.cache.use_redis,
            self.cache.ttl_secs,
            self.cache.max_size,
            self.pubsub.request_channel,
            self.pubsub.response_channel,
            self.exchange.name,
        );
    }
}
