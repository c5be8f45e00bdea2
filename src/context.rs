//! Process-wide wiring, built once at startup and passed to whatever needs it.

use crate::cache::MarketCache;
use crate::config::Config;
use crate::error::BrokerError;
use crate::exchange::{register_market_tools, ExchangeClient, MarketDataService};
use crate::pubsub::{ChannelConfig, MessageBus, RedisBus, RequestBroker, WorkerLoop};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    config: Arc<Config>,
    bus: Arc<dyn MessageBus>,
}

impl AppContext {
    /// Connects the Redis pub/sub transport described by `config`.
    pub async fn connect(config: Arc<Config>) -> Result<Self, BrokerError> {
        let bus = RedisBus::connect(&config.redis).await?;
        Ok(Self::with_bus(config, Arc::new(bus)))
    }

    pub fn with_bus(config: Arc<Config>, bus: Arc<dyn MessageBus>) -> Self {
        Self { config, bus }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channels(&self) -> ChannelConfig {
        ChannelConfig::from(&self.config.pubsub)
    }

    pub fn broker(&self) -> RequestBroker {
        RequestBroker::new(Arc::clone(&self.bus), self.channels())
    }

    /// Market data service over `exchange`, using the configured cache
    /// backend (falling back to the local cache if Redis is unreachable).
    pub async fn market_service(&self, exchange: Arc<dyn ExchangeClient>) -> MarketDataService {
        let cache = MarketCache::select(&self.config).await;
        MarketDataService::new(exchange, Arc::new(cache))
    }

    /// Worker with every market tool registered.
    pub async fn market_worker(&self, exchange: Arc<dyn ExchangeClient>) -> WorkerLoop {
        let service = self.market_service(exchange).await;
        let mut worker = WorkerLoop::new(Arc::clone(&self.bus), self.channels())
            .with_max_in_flight(self.config.pubsub.max_in_flight);
        register_market_tools(&mut worker, service);
        worker
    }
}
