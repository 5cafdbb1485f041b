//! MQTT bus provider
//!
//! Implements `BusProvider` on top of `rumqttc` with QoS 1 (at-least-once)
//! for both subscriptions and publishes. Inbound messages are acknowledged
//! manually, after the bridge has handled them. Reconnecting after a lost session
//! is left to rumqttc, which retries on the next event-loop poll.

mod client;

pub use client::{describe_return_code, MqttClient};

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::provider::{BusEvent, BusProvider, InboundMessage, Publisher};
use async_trait::async_trait;
use rumqttc::AsyncClient;
use std::sync::Arc;

/// MQTT bus provider
///
/// Wraps `MqttClient` and implements the `BusProvider` trait.
pub struct MqttProvider {
    client: MqttClient,
}

impl MqttProvider {
    /// Create the provider; `connect()` opens the session
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            client: MqttClient::new(config),
        }
    }

    /// Get the underlying MQTT client for advanced usage
    pub fn client(&self) -> &MqttClient {
        &self.client
    }
}

#[async_trait]
impl Publisher for MqttProvider {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client.publish(topic, payload).await
    }
}

#[async_trait]
impl BusProvider for MqttProvider {
    async fn connect(&mut self) -> Result<()> {
        self.client.connect().await
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.subscribe(topic).await
    }

    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        self.client.ack(message).await
    }

    async fn next_event(&mut self) -> Option<BusEvent> {
        self.client.next_event().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.client.disconnect().await
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MqttPublisher {
            client: self.client.async_client().clone(),
        })
    }

    fn name(&self) -> &str {
        "mqtt"
    }
}

/// Publish handle sharing the provider's request channel
struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        client::publish_with(&self.client, topic, payload).await
    }
}

/// Operator hints logged when the broker cannot be reached at startup
pub fn connection_hints(config: &BridgeConfig) -> Vec<String> {
    vec![
        "Check broker status: sudo systemctl status mosquitto".to_string(),
        format!("Check listening port: ss -tlnp | grep {}", config.broker_port),
        format!(
            "Check broker host/IP value: {} (MQTT_BROKER_HOST / MQTT_BROKER)",
            config.broker_host
        ),
    ]
}
