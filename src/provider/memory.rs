//! In-memory bus provider for tests and local runs
//!
//! `MemoryProvider::new` returns the provider together with a
//! `MemoryHandle`. The handle plays the broker: it delivers inbound
//! messages, drops or restores the session, and records everything the
//! bridge publishes.

use super::{BusEvent, BusProvider, InboundMessage, Publisher};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory provider configuration
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Make `connect()` fail, as an unreachable broker would
    pub refuse_connect: bool,
}

/// A message published through the in-memory bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Payload parsed as JSON
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

enum Feed {
    Event(BusEvent),
    Close,
}

#[derive(Default)]
struct Shared {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    connected: AtomicBool,
    fail_publish: AtomicBool,
    disconnects: AtomicUsize,
    next_delivery_id: AtomicUsize,
    acked: Mutex<Vec<u16>>,
    dropped: Mutex<Vec<InboundMessage>>,
}

/// In-memory `BusProvider`
pub struct MemoryProvider {
    config: MemoryConfig,
    shared: Arc<Shared>,
    feed: mpsc::UnboundedReceiver<Feed>,
    pending: Mutex<VecDeque<BusEvent>>,
}

/// Broker-side controls for a `MemoryProvider`
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Shared>,
    feed: mpsc::UnboundedSender<Feed>,
}

impl MemoryProvider {
    pub fn new(config: MemoryConfig) -> (Self, MemoryHandle) {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = Self {
            config,
            shared: shared.clone(),
            feed: rx,
            pending: Mutex::new(VecDeque::new()),
        };
        (provider, MemoryHandle { shared, feed: tx })
    }

    /// Provider with default config
    pub fn pair() -> (Self, MemoryHandle) {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl Publisher for MemoryProvider {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        publish_shared(&self.shared, topic, payload)
    }
}

#[async_trait]
impl BusProvider for MemoryProvider {
    async fn connect(&mut self) -> Result<()> {
        if self.config.refuse_connect {
            return Err(BridgeError::Connection(
                "memory broker refused the connection".to_string(),
            ));
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        lock(&self.shared.subscriptions).push(topic.to_string());
        lock(&self.pending).push_back(BusEvent::Subscribed { accepted: true });
        Ok(())
    }

    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        if let Some(id) = message.delivery_id {
            lock(&self.shared.acked).push(id);
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BusEvent> {
        let queued = lock(&self.pending).pop_front();
        if queued.is_some() {
            return queued;
        }

        match self.feed.recv().await? {
            Feed::Event(event) => {
                match &event {
                    BusEvent::Connected { .. } => self.shared.connected.store(true, Ordering::SeqCst),
                    BusEvent::Disconnected { .. } => {
                        self.shared.connected.store(false, Ordering::SeqCst)
                    }
                    _ => {}
                }
                Some(event)
            }
            Feed::Close => None,
        }
    }

    /// Messages still queued are discarded unacknowledged, as a broker
    /// would do with a closed clean session
    async fn disconnect(&mut self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);

        self.feed.close();
        while let Ok(feed) = self.feed.try_recv() {
            if let Feed::Event(BusEvent::Message(message)) = feed {
                tracing::warn!(
                    topic = %message.topic,
                    delivery_id = ?message.delivery_id,
                    "Dropping undispatched message at shutdown (not acknowledged)"
                );
                lock(&self.shared.dropped).push(message);
            }
        }
        Ok(())
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MemoryPublisher {
            shared: self.shared.clone(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryPublisher {
    shared: Arc<Shared>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        publish_shared(&self.shared, topic, payload)
    }
}

fn publish_shared(shared: &Shared, topic: &str, payload: Vec<u8>) -> Result<()> {
    if shared.fail_publish.load(Ordering::SeqCst) {
        return Err(BridgeError::Publish {
            topic: topic.to_string(),
            reason: "memory broker rejected the publish".to_string(),
        });
    }
    lock(&shared.published).push(PublishedMessage {
        topic: topic.to_string(),
        payload,
    });
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryHandle {
    /// Deliver a QoS 1 message as if the broker routed it to the bridge
    ///
    /// Each delivery gets the next packet id, starting at 1.
    pub fn deliver(&self, topic: &str, payload: impl Into<bytes::Bytes>) -> bool {
        let id = self.shared.next_delivery_id.fetch_add(1, Ordering::SeqCst) as u16 + 1;
        self.send(BusEvent::Message(
            InboundMessage::new(topic, payload).with_delivery_id(id),
        ))
    }

    /// Simulate a lost session
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.send(BusEvent::Disconnected {
            reason: reason.to_string(),
        })
    }

    /// Simulate the client library re-establishing the session
    pub fn restore_connection(&self) -> bool {
        self.send(BusEvent::Connected {
            session_present: false,
        })
    }

    /// End the provider's event stream
    pub fn close(&self) {
        let _ = self.feed.send(Feed::Close);
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn set_publish_failure(&self, fail: bool) {
        self.shared.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.shared.published).clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.shared.subscriptions).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Packet ids acknowledged by the client, in ack order
    pub fn acked(&self) -> Vec<u16> {
        lock(&self.shared.acked).clone()
    }

    /// Messages discarded unacknowledged by `disconnect()`
    pub fn dropped(&self) -> Vec<InboundMessage> {
        lock(&self.shared.dropped).clone()
    }

    /// Number of `disconnect()` calls made by the client side
    pub fn disconnects(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages were published or `timeout` passes
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<PublishedMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let published = self.published();
            if published.len() >= count || tokio::time::Instant::now() >= deadline {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn send(&self, event: BusEvent) -> bool {
        self.feed.send(Feed::Event(event)).is_ok()
    }
}
