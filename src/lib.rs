pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod pubsub;
pub mod utils;

pub use cache::{DistributedCache, MarketCache, TtlCache};
pub use context::AppContext;
pub use error::{BrokerError, CacheError, ExchangeError, ToolError, ToolResult};
pub use pubsub::{InMemoryBus, RedisBus, RequestBroker, WorkerLoop};
