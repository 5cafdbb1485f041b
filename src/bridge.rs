//! Bridge service — connection state machine and the serialized event loop
//!
//! `Bridge` owns the bus provider and a `Dispatcher`. Events from the bus
//! are consumed one at a time; a message is fully processed (agent call
//! and publish included) before the next event is looked at, and is only
//! acknowledged to the broker after that.

use crate::agent::AgentRunner;
use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::provider::{BusEvent, BusProvider, InboundMessage, Publisher};
use crate::types::ResponseEnvelope;
use std::future::Future;
use std::sync::Arc;

/// Session state as seen by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

enum Step {
    Shutdown,
    Event(Option<BusEvent>),
}

/// Bus ⇄ agent bridge
pub struct Bridge {
    config: BridgeConfig,
    provider: Box<dyn BusProvider>,
    publisher: Arc<dyn Publisher>,
    dispatcher: Dispatcher,
    state: ConnectionState,
    processed: u64,
}

impl Bridge {
    /// Create a bridge; nothing touches the network until `connect()`
    pub fn new(
        config: BridgeConfig,
        provider: impl BusProvider + 'static,
        agent: Arc<dyn AgentRunner>,
    ) -> Self {
        let dispatcher = Dispatcher::new(agent, config.outbound_topic.clone(), config.status_policy);
        let publisher = provider.publisher();
        Self {
            config,
            provider: Box::new(provider),
            publisher,
            dispatcher,
            state: ConnectionState::Disconnected,
            processed: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of inbound messages dispatched so far
    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Open the session and request the inbound subscription
    ///
    /// A failure here is final; the bridge does not retry.
    pub async fn connect(&mut self) -> Result<()> {
        tracing::info!(
            provider = self.provider.name(),
            broker = %self.config.broker_addr(),
            client_id = %self.config.client_id,
            "Connecting to broker"
        );
        self.transition(ConnectionState::Connecting);

        if let Err(e) = self.provider.connect().await {
            self.transition(ConnectionState::Disconnected);
            return Err(e);
        }

        self.transition(ConnectionState::Connected);
        self.subscribe_inbound().await
    }

    /// Consume bus events until `shutdown` resolves or the event stream ends,
    /// then close the session
    ///
    /// The shutdown future is only checked between events; an in-flight
    /// dispatch always runs to completion.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stream_ended = false;

        loop {
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => Step::Shutdown,
                event = self.provider.next_event() => Step::Event(event),
            };

            match step {
                Step::Shutdown => {
                    tracing::info!("Shutdown signal received. Stopping...");
                    break;
                }
                Step::Event(Some(event)) => self.handle_event(event).await,
                Step::Event(None) => {
                    tracing::error!(provider = self.provider.name(), "Bus event stream ended");
                    stream_ended = true;
                    break;
                }
            }
        }

        self.shutdown().await?;

        if stream_ended {
            return Err(BridgeError::Connection(format!(
                "{} event stream ended unexpectedly",
                self.provider.name()
            )));
        }
        Ok(())
    }

    /// Run until the event stream ends
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Close the session; safe to call more than once
    pub async fn shutdown(&mut self) -> Result<()> {
        let result = self.provider.disconnect().await;
        self.transition(ConnectionState::Disconnected);
        tracing::info!(processed = self.processed, "Service stopped");
        result
    }

    /// Apply one bus event
    pub async fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected { session_present } => {
                tracing::info!(
                    broker = %self.config.broker_addr(),
                    session_present,
                    "Reconnected to broker"
                );
                self.transition(ConnectionState::Connected);
                if let Err(e) = self.subscribe_inbound().await {
                    tracing::error!(error = %e, "Re-subscribe after reconnect failed");
                }
            }
            BusEvent::Subscribed { accepted: true } => {
                tracing::info!(topic = %self.config.inbound_topic, "Subscribed to topic");
                self.transition(ConnectionState::Subscribed);
            }
            BusEvent::Subscribed { accepted: false } => {
                tracing::error!(
                    topic = %self.config.inbound_topic,
                    "Broker rejected the subscription"
                );
            }
            BusEvent::Message(message) => {
                self.dispatch(message).await;
            }
            BusEvent::Disconnected { reason } => {
                if self.state == ConnectionState::Disconnected {
                    tracing::debug!(%reason, "Still disconnected");
                } else {
                    tracing::warn!(%reason, "Unexpected MQTT disconnect");
                    self.transition(ConnectionState::Disconnected);
                }
            }
        }
    }

    async fn dispatch(&mut self, message: InboundMessage) -> ResponseEnvelope {
        tracing::info!(
            topic = %message.topic,
            bytes = message.payload.len(),
            "Message received"
        );
        let envelope = self
            .dispatcher
            .dispatch(self.publisher.as_ref(), &message.payload)
            .await;
        self.processed += 1;

        if let Err(e) = self.provider.ack(&message).await {
            tracing::warn!(
                topic = %message.topic,
                delivery_id = ?message.delivery_id,
                error = %e,
                "Failed to acknowledge message"
            );
        }
        envelope
    }

    async fn subscribe_inbound(&mut self) -> Result<()> {
        self.provider.subscribe(&self.config.inbound_topic).await
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "Connection state changed");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{MemoryConfig, MemoryHandle, MemoryProvider};
    use crate::types::AgentReply;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoAgent;

    #[async_trait]
    impl AgentRunner for EchoAgent {
        async fn run(&self, message: &str) -> AgentReply {
            AgentReply::success(format!("echo: {}", message))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            inbound_topic: "AI_CMD".to_string(),
            outbound_topic: "AI_RET".to_string(),
            client_id: "bridge-test".to_string(),
            ..Default::default()
        }
    }

    fn bridge() -> (Bridge, MemoryHandle) {
        let (provider, handle) = MemoryProvider::pair();
        (Bridge::new(config(), provider, Arc::new(EchoAgent)), handle)
    }

    #[tokio::test]
    async fn test_connect_subscribes_inbound_topic() {
        let (mut bridge, handle) = bridge();
        assert_eq!(bridge.state(), ConnectionState::Disconnected);

        bridge.connect().await.unwrap();
        assert_eq!(bridge.state(), ConnectionState::Connected);
        assert_eq!(handle.subscriptions(), vec!["AI_CMD".to_string()]);

        bridge
            .handle_event(BusEvent::Subscribed { accepted: true })
            .await;
        assert_eq!(bridge.state(), ConnectionState::Subscribed);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let (provider, _handle) = MemoryProvider::new(MemoryConfig {
            refuse_connect: true,
        });
        let mut bridge = Bridge::new(config(), provider, Arc::new(EchoAgent));

        assert!(bridge.connect().await.is_err());
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejected_subscription_keeps_connected_state() {
        let (mut bridge, _handle) = bridge();
        bridge.connect().await.unwrap();
        bridge
            .handle_event(BusEvent::Subscribed { accepted: false })
            .await;
        assert_eq!(bridge.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect_resubscribes() {
        let (mut bridge, handle) = bridge();
        bridge.connect().await.unwrap();

        bridge
            .handle_event(BusEvent::Disconnected {
                reason: "keep-alive timeout".to_string(),
            })
            .await;
        assert_eq!(bridge.state(), ConnectionState::Disconnected);

        bridge
            .handle_event(BusEvent::Connected {
                session_present: false,
            })
            .await;
        assert_eq!(bridge.state(), ConnectionState::Connected);
        assert_eq!(handle.subscriptions().len(), 2);
    }

    #[tokio::test]
    async fn test_message_event_publishes_reply() {
        let (mut bridge, handle) = bridge();
        bridge.connect().await.unwrap();

        bridge
            .handle_event(BusEvent::Message(InboundMessage::new("AI_CMD", "hello")))
            .await;

        assert_eq!(bridge.processed(), 1);
        let published = handle.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "AI_RET");
        assert_eq!(published[0].json().unwrap()["response"], "echo: hello");
    }

    #[tokio::test]
    async fn test_run_until_shutdown_disconnects() {
        let (mut bridge, handle) = bridge();
        bridge.connect().await.unwrap();
        handle.deliver("AI_CMD", "one");
        handle.deliver("AI_CMD", "two");

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let watcher = handle.clone();
        tokio::spawn(async move {
            watcher.wait_for_published(2, Duration::from_secs(5)).await;
            let _ = stop_tx.send(());
        });

        bridge
            .run_until(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();

        assert_eq!(bridge.processed(), 2);
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        assert_eq!(handle.disconnects(), 1);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_message_is_acked_after_reply_is_published() {
        let (mut bridge, handle) = bridge();
        bridge.connect().await.unwrap();
        handle.deliver("AI_CMD", "hello");

        // Subscribed, then the message
        let suback = bridge.provider.next_event().await.unwrap();
        bridge.handle_event(suback).await;
        assert!(handle.acked().is_empty());

        let message = bridge.provider.next_event().await.unwrap();
        bridge.handle_event(message).await;
        assert_eq!(handle.published().len(), 1);
        assert_eq!(handle.acked(), vec![1]);
    }

    #[tokio::test]
    async fn test_queued_messages_at_shutdown_are_dropped_unacked() {
        let (mut bridge, handle) = bridge();
        bridge.connect().await.unwrap();
        handle.deliver("AI_CMD", "one");
        handle.deliver("AI_CMD", "two");
        handle.deliver("AI_CMD", "three");

        // Shutdown wins the biased select before any event is read
        bridge.run_until(async {}).await.unwrap();

        assert_eq!(bridge.processed(), 0);
        assert!(handle.published().is_empty());
        assert!(handle.acked().is_empty());
        let dropped: Vec<_> = handle.dropped().into_iter().map(|m| m.payload).collect();
        assert_eq!(dropped, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_stream_end_is_an_error_but_still_disconnects() {
        let (mut bridge, handle) = bridge();
        bridge.connect().await.unwrap();
        handle.close();

        let err = bridge.run().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert_eq!(handle.disconnects(), 1);
    }
}
