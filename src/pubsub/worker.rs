//! Server side of the delegation protocol: consume requests, dispatch to a
//! registered handler, publish the response.

use super::{ChannelConfig, MessageBus, RequestEnvelope, ResponseEnvelope};
use crate::error::{BrokerError, ToolResult};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// A callable tool. Argument validation is the handler's job.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Map<String, Value>) -> ToolResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult> + Send,
{
    async fn call(&self, arguments: Map<String, Value>) -> ToolResult {
        (self.0)(arguments).await
    }
}

/// Wraps an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

pub type HandlerTable = HashMap<String, Arc<dyn ToolHandler>>;

pub struct WorkerLoop {
    bus: Arc<dyn MessageBus>,
    channels: ChannelConfig,
    handlers: HandlerTable,
    max_in_flight: usize,
}

impl WorkerLoop {
    pub fn new(bus: Arc<dyn MessageBus>, channels: ChannelConfig) -> Self {
        Self {
            bus,
            channels,
            handlers: HashMap::new(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Caps the number of requests handled concurrently.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Registers `handler` under `tool_name`; a later registration for the
    /// same name replaces the earlier one.
    pub fn register_handler(
        &mut self,
        tool_name: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> &mut Self {
        let tool_name = tool_name.into();
        if self.handlers.insert(tool_name.clone(), handler).is_some() {
            debug!("Replaced handler for tool {}", tool_name);
        }
        self
    }

    pub fn has_handler(&self, tool_name: &str) -> bool {
        self.handlers.contains_key(tool_name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Subscribes to the request channel and serves requests until the
    /// returned future is dropped.
    ///
    /// Each request runs in its own task, so responses may be published out
    /// of request order. Malformed requests are dropped; handler errors and
    /// panics become error responses. Only a failed subscription or the
    /// subscription ending ends the loop, with a `Transport` error.
    pub async fn start_worker(&self) -> Result<(), BrokerError> {
        let mut requests = self.bus.subscribe(&self.channels.request_channel).await?;
        // The table is frozen for the lifetime of this loop.
        let handlers: Arc<HandlerTable> = Arc::new(self.handlers.clone());
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        info!(
            "Worker listening on {} with tools [{}]",
            self.channels.request_channel,
            self.tool_names().join(", ")
        );

        while let Some(payload) = requests.next().await {
            let request: RequestEnvelope = match serde_json::from_slice(&payload) {
                Ok(request) => request,
                Err(e) => {
                    debug!("Dropping malformed request ({} bytes): {}", payload.len(), e);
                    continue;
                }
            };

            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let handlers = Arc::clone(&handlers);
            let bus = Arc::clone(&self.bus);
            let response_channel = self.channels.response_channel.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let response = dispatch(&handlers, request).await;
                let id = response.id.clone();
                let payload = match serde_json::to_vec(&response) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("Could not encode response {}: {}", id, e);
                        return;
                    }
                };
                if let Err(e) = bus.publish(&response_channel, payload).await {
                    error!("Failed to publish response {}: {}", id, e);
                }
            });
        }

        warn!(
            "Request subscription on {} closed",
            self.channels.request_channel
        );
        Err(BrokerError::Transport(format!(
            "request subscription on {} closed",
            self.channels.request_channel
        )))
    }
}

/// Runs one request against the handler table and builds its response.
pub async fn dispatch(handlers: &HandlerTable, request: RequestEnvelope) -> ResponseEnvelope {
    let RequestEnvelope {
        id,
        tool,
        arguments,
    } = request;

    let Some(handler) = handlers.get(&tool) else {
        warn!("Request {} names unknown tool {}", id, tool);
        return ResponseEnvelope::failure(id, format!("Unknown tool: {}", tool));
    };

    match AssertUnwindSafe(handler.call(arguments)).catch_unwind().await {
        Ok(Ok(result)) => ResponseEnvelope::success(id, result),
        Ok(Err(e)) => {
            debug!("Tool {} failed for request {}: {}", tool, id, e);
            ResponseEnvelope::failure(id, e.to_string())
        }
        Err(panic) => {
            error!("Tool {} panicked on request {}", tool, id);
            let message = format!("Tool {} panicked: {}", tool, panic_message(&*panic));
            ResponseEnvelope::failure(id, message)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
