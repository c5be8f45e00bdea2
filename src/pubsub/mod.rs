//! Request/response delegation over a shared publish/subscribe medium.
//!
//! Front-end processes publish tool calls with a [`RequestBroker`]; worker
//! processes answer them with a [`WorkerLoop`]. Requests and responses are
//! JSON envelopes correlated by id:
//!
//! ```text
//! request channel:  {"id": "...", "tool": "get_ticker", "arguments": {...}}
//! response channel: {"id": "...", "result": ...} | {"id": "...", "error": "..."}
//! ```

pub mod broker;
pub mod bus;
pub mod worker;

pub use broker::RequestBroker;
pub use bus::{InMemoryBus, RedisBus};
pub use worker::{handler_fn, ToolHandler, WorkerLoop};

use crate::config::PubSubSettings;
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw message body as carried by the bus.
pub type Payload = Vec<u8>;

/// Stream of messages received on one channel.
pub type Subscription = BoxStream<'static, Payload>;

/// Publish/subscribe transport shared by brokers and workers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), BrokerError>;

    /// Returns once the subscription is active, so nothing published after
    /// this call completes is missed.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub request_channel: String,
    pub response_channel: String,
}

impl ChannelConfig {
    pub fn new(request_channel: impl Into<String>, response_channel: impl Into<String>) -> Self {
        Self {
            request_channel: request_channel.into(),
            response_channel: response_channel.into(),
        }
    }
}

impl From<&PubSubSettings> for ChannelConfig {
    fn from(settings: &PubSubSettings) -> Self {
        Self::new(&settings.request_channel, &settings.response_channel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Exactly one of `result` / `error` is set by the constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// `error` wins if a producer sent both. A `null` result decodes as
    /// absent and comes back as `Value::Null`.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
