//! Bus provider traits — the seam between the bridge and a message bus
//!
//! A backend (MQTT, in-memory) implements `BusProvider` for the connection
//! lifecycle and inbound event stream, and `Publisher` for outbound
//! messages. The publisher half is `Send + Sync` on its own so it can be
//! shared with concurrent dispatchers.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub mod memory;
pub mod mqtt;

/// Outbound half of a bus connection
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a payload to a topic with acknowledged (at-least-once) delivery
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Core trait for bus backends
#[async_trait]
pub trait BusProvider: Publisher {
    /// Open the session; returns once the broker has accepted it
    async fn connect(&mut self) -> Result<()>;

    /// Request a subscription; confirmation arrives as `BusEvent::Subscribed`
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Confirm a delivered message to the broker
    ///
    /// Called once the message has been fully handled. Messages without a
    /// `delivery_id` need no confirmation.
    async fn ack(&self, message: &InboundMessage) -> Result<()>;

    /// Next event from the bus, or `None` once the event stream has ended
    async fn next_event(&mut self) -> Option<BusEvent>;

    /// Close the session
    async fn disconnect(&mut self) -> Result<()>;

    /// Shareable handle for publishing
    fn publisher(&self) -> Arc<dyn Publisher>;

    /// Provider name (e.g., "mqtt", "memory")
    fn name(&self) -> &str;
}

/// Notification delivered by a provider's network side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The broker accepted a (re)connection
    Connected { session_present: bool },

    /// The broker answered a subscribe request
    Subscribed { accepted: bool },

    /// A message arrived on a subscribed topic
    Message(InboundMessage),

    /// The session was lost or closed
    Disconnected { reason: String },
}

/// Raw message as delivered by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Broker packet id awaiting acknowledgement (QoS 1); `None` when the
    /// message needs no ack
    pub delivery_id: Option<u16>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            delivery_id: None,
        }
    }

    /// Attach the packet id to acknowledge after handling
    pub fn with_delivery_id(mut self, delivery_id: u16) -> Self {
        self.delivery_id = Some(delivery_id);
        self
    }
}
