//! Channel broker - named publish/subscribe channels over one shared transport.
//!
//! Coordinator and worker already hold exactly one duplex channel between
//! them; the broker multiplexes independent logical channels onto it by
//! tagging every outgoing payload with a channel name. Inbound traffic is
//! fed through [`Broker::handle_message`], which routes broker envelopes to
//! the registered listeners and leaves everything else to the
//! control-protocol handler. Payload contents are never interpreted here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde_json::Value;

use crate::bridge::protocol::{BROKER_CHANNEL_KEY, BrokerEnvelope};
use crate::transport::{RawTransport, TransportError};

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

pub struct Broker {
    transport: Arc<dyn RawTransport>,
    listeners: StdMutex<HashMap<String, Vec<Listener>>>,
}

impl Broker {
    pub fn new(transport: Arc<dyn RawTransport>) -> Self {
        Self {
            transport,
            listeners: StdMutex::new(HashMap::new()),
        }
    }

    /// Register `callback` on `channel`. A channel may hold any number of
    /// listeners; delivery preserves registration order.
    pub fn listen<F>(&self, channel: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let channel = channel.into();
        tracing::debug!(%channel, "Registering broker listener");
        self.lock_listeners()
            .entry(channel)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Publish `payload` on `channel`. Suspends until the transport accepts
    /// the send; there is no delivery confirmation.
    pub async fn send(
        &self,
        channel: impl Into<String>,
        payload: Value,
    ) -> Result<(), TransportError> {
        let envelope = BrokerEnvelope {
            broker_channel: channel.into(),
            data: payload,
        };
        let message = serde_json::to_value(&envelope)?;
        self.transport.send(message).await
    }

    /// Inbound entry point for every message the transport delivers.
    ///
    /// Returns `false` for messages without the channel marker (control
    /// protocol traffic, not ours). Returns `true` once a broker envelope
    /// has been routed - including to zero listeners, which is the normal
    /// startup race for channels nobody has subscribed to yet.
    pub fn handle_message(&self, message: &Value) -> bool {
        let Some(channel) = message.get(BROKER_CHANNEL_KEY).and_then(Value::as_str) else {
            return false;
        };
        let data = message.get("data").cloned().unwrap_or(Value::Null);

        // Snapshot the listener set so callbacks run without the registry
        // lock, letting them re-enter listen().
        let callbacks: Vec<Listener> = self
            .lock_listeners()
            .get(channel)
            .cloned()
            .unwrap_or_default();

        if callbacks.is_empty() {
            tracing::trace!(%channel, "Dropping message for channel with no listeners");
            return true;
        }

        tracing::trace!(%channel, listeners = callbacks.len(), "Dispatching broker message");
        for callback in &callbacks {
            callback(&data);
        }
        true
    }

    /// Number of listeners registered on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.lock_listeners()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    // Registry is never held across an await; recover from poison.
    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Listener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
