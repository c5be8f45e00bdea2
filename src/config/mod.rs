pub mod settings;

pub use settings::{CacheSettings, Config, ExchangeSettings, PubSubSettings, RedisSettings};

use crate::error::ConfigError;
use std::sync::Arc;

/// Loads `.env` (if present), reads the configuration from the environment
/// and validates it.
pub fn load_config() -> Result<Arc<Config>, ConfigError> {
    dotenv::dotenv().ok(); // Load .env file if present, ignore errors

    let config = Config::from_env();
    config.validate()?;
    config.log_settings();

    Ok(Arc::new(config))
}
