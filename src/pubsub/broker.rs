//! Client side of the delegation protocol.
//!
//! Each `publish_request` registers a one-shot completion under a fresh id,
//! makes sure the single response listener is running, publishes the
//! request and waits with a deadline. The listener is the only task that
//! resolves completions; it removes the pending entry and fires it in one
//! step under the table lock, so a duplicate or late response for the same
//! id finds nothing and is discarded.

use super::{ChannelConfig, MessageBus, RequestEnvelope, ResponseEnvelope, Subscription};
use crate::error::BrokerError;
use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A request waiting for its response.
struct PendingRequest {
    tool: String,
    created_at: Instant,
    completion: oneshot::Sender<Result<Value, String>>,
}

type PendingTable = Mutex<HashMap<String, PendingRequest>>;

fn lock(pending: &PendingTable) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the pending entry on every exit path of `publish_request`,
/// including the caller dropping the future.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.id);
    }
}

/// The running response listener. `closed` is raised as soon as its
/// subscription ends, before the task itself has finished.
struct Listener {
    handle: JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

impl Listener {
    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.handle.is_finished()
    }
}

pub struct RequestBroker {
    bus: Arc<dyn MessageBus>,
    channels: ChannelConfig,
    pending: Arc<PendingTable>,
    listener: tokio::sync::Mutex<Option<Listener>>,
}

impl RequestBroker {
    pub fn new(bus: Arc<dyn MessageBus>, channels: ChannelConfig) -> Self {
        Self {
            bus,
            channels,
            pending: Arc::new(Mutex::new(HashMap::new())),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    pub fn channels(&self) -> &ChannelConfig {
        &self.channels
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.pending).contains_key(id)
    }

    /// Publishes a tool call and waits up to `timeout` for its response.
    ///
    /// Fails with `Timeout` if no matching response arrives in time,
    /// `Remote` if the worker reported an error, and `Transport` if the
    /// subscription or publish failed. Nothing is retried.
    pub async fn publish_request(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, BrokerError> {
        let id = Uuid::new_v4();
        let key = id.to_string();

        let (completion, response) = oneshot::channel();
        lock(&self.pending).insert(
            key.clone(),
            PendingRequest {
                tool: tool_name.to_string(),
                created_at: Instant::now(),
                completion,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &key,
        };

        self.ensure_listener().await?;

        let request = RequestEnvelope {
            id: key.clone(),
            tool: tool_name.to_string(),
            arguments,
        };
        let payload = serde_json::to_vec(&request)?;
        self.bus
            .publish(&self.channels.request_channel, payload)
            .await?;
        debug!("Published request {} for tool {}", key, tool_name);

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(BrokerError::Remote(message)),
            Ok(Err(_)) => Err(BrokerError::Transport(format!(
                "response listener stopped before request {} completed",
                key
            ))),
            Err(_) => {
                warn!("Request {} for tool {} timed out after {:?}", key, tool_name, timeout);
                Err(BrokerError::Timeout { id, timeout })
            }
        }
    }

    /// Starts the response listener unless one is already running.
    async fn ensure_listener(&self) -> Result<(), BrokerError> {
        let mut listener = self.listener.lock().await;
        if let Some(current) = listener.take() {
            if current.is_alive() {
                *listener = Some(current);
                return Ok(());
            }
            warn!("Response listener had stopped; resubscribing");
            current.handle.abort();
        }

        let responses = self.bus.subscribe(&self.channels.response_channel).await?;
        info!(
            "Listening for responses on {}",
            self.channels.response_channel
        );
        let pending = Arc::clone(&self.pending);
        let closed = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(listen_responses(responses, pending, Arc::clone(&closed)));
        *listener = Some(Listener { handle, closed });
        Ok(())
    }

    /// Stops the listener and fails every request still waiting with a
    /// `Transport` error.
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.handle.abort();
        }
        let abandoned = {
            let mut pending = lock(&self.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        info!("Request broker shut down ({} pending requests abandoned)", abandoned);
    }
}

impl Drop for RequestBroker {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.handle.abort();
        }
    }
}

async fn listen_responses(
    mut responses: Subscription,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
) {
    while let Some(payload) = responses.next().await {
        let envelope: ResponseEnvelope = match serde_json::from_slice(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping malformed response ({} bytes): {}", payload.len(), e);
                continue;
            }
        };

        let entry = lock(&pending).remove(&envelope.id);
        match entry {
            Some(request) => {
                let id = envelope.id.clone();
                debug!(
                    "Request {} for tool {} resolved after {:?}",
                    id,
                    request.tool,
                    request.created_at.elapsed()
                );
                if request.completion.send(envelope.into_result()).is_err() {
                    debug!("Caller for request {} went away before its response", id);
                }
            }
            None => debug!(
                "Discarding response for unknown or already resolved request {}",
                envelope.id
            ),
        }
    }

    // Raised before clearing: a request registered after the clear must
    // see a dead listener and resubscribe.
    closed.store(true, Ordering::SeqCst);
    let abandoned: Vec<(String, PendingRequest)> = lock(&pending).drain().collect();
    warn!(
        "Response subscription closed; failing {} pending requests",
        abandoned.len()
    );
    for (id, request) in abandoned {
        debug!(
            "Request {} for tool {} abandoned after {:?}",
            id,
            request.tool,
            request.created_at.elapsed()
        );
    }
}
