//! Pluggable wire between tabs.
//!
//! The router never talks to a channel directly; it sends and receives
//! [`RouterMessage`]s through the [`Transport`] trait. The bundled
//! [`BroadcastTransport`] fans every message out to all subscribers,
//! sender included, which models a browser broadcast channel: receivers
//! are responsible for discarding their own messages.

use mesh_core::BusEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Default buffered capacity of the in-process transport.
const DEFAULT_CAPACITY: usize = 256;

/// Transport failures. Delivery is best-effort; a transport with no
/// listeners is not an error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying channel is closed.
    #[error("Transport closed")]
    Closed,
}

/// Envelope carried between tabs: an event plus a routing header, or a
/// discovery heartbeat. Opaque to the bus itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RouterMessage {
    /// A forwarded bus event.
    #[serde(rename_all = "camelCase")]
    Event {
        /// Canvas the event was forwarded from.
        source_canvas_id: String,
        /// Canvas the event is addressed to; `None` with `broadcast`
        /// means every canvas.
        target_canvas_id: Option<String>,
        /// Deliver to every connected canvas.
        broadcast: bool,
        /// The event itself.
        event: BusEvent,
    },
    /// Discovery heartbeat.
    #[serde(rename_all = "camelCase")]
    Ping {
        /// Canvas announcing itself.
        canvas_id: String,
        /// Tab the canvas lives in.
        tab_id: String,
    },
    /// Heartbeat reply.
    #[serde(rename_all = "camelCase")]
    Pong {
        /// Canvas replying.
        canvas_id: String,
        /// Tab the canvas lives in.
        tab_id: String,
    },
}

/// One cross-tab wire. Implementations must fan each sent message out
/// to every subscriber, including the sender's own receiver.
pub trait Transport: Send + Sync {
    /// Send a message to every connected tab.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] when the wire is gone for good.
    fn send(&self, message: RouterMessage) -> Result<(), TransportError>;

    /// Open a receiver for incoming messages.
    fn subscribe(&self) -> broadcast::Receiver<RouterMessage>;
}

/// In-process fan-out transport over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastTransport {
    sender: broadcast::Sender<RouterMessage>,
}

impl BroadcastTransport {
    /// A transport buffering up to `capacity` undelivered messages per
    /// receiver; slow receivers lag rather than block senders.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for BroadcastTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Transport for BroadcastTransport {
    fn send(&self, message: RouterMessage) -> Result<(), TransportError> {
        // A send with no live receivers is a quiet no-op, like
        // broadcasting into an empty room.
        let _ = self.sender.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RouterMessage> {
        self.sender.subscribe()
    }
}
