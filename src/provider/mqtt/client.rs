//! MQTT client — connect, subscribe, publish, event forwarding

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::provider::{BusEvent, InboundMessage};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS, SubscribeReasonCode,
};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Pending client requests (publish/subscribe) buffered ahead of the event loop
const REQUEST_CAPACITY: usize = 64;

/// Bus events buffered between the network task and the dispatcher
const EVENT_CAPACITY: usize = 64;

/// Agent answers can be long; rumqttc defaults to 10 KiB
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Pause between polls after a network error; the next poll reconnects
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Time allowed for the DISCONNECT packet to be flushed on shutdown
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// MQTT client
///
/// Owns the `rumqttc` client/event-loop pair. After `connect()` the event
/// loop runs on its own task so keep-alive pings keep flowing while the
/// consumer is busy; its events are forwarded through a bounded channel.
pub struct MqttClient {
    client: AsyncClient,
    /// Only touched through `&mut self`; the mutex makes the client `Sync`
    eventloop: Mutex<Option<EventLoop>>,
    events: Option<mpsc::Receiver<BusEvent>>,
    forwarder: Option<JoinHandle<()>>,
    broker: String,
    connect_timeout: Duration,
    closed: bool,
}

impl MqttClient {
    /// Create the client; no network traffic happens until `connect()`
    pub fn new(config: &BridgeConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(build_mqtt_options(config), REQUEST_CAPACITY);
        Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            events: None,
            forwarder: None,
            broker: config.broker_addr(),
            connect_timeout: config.connect_timeout(),
            closed: false,
        }
    }

    /// Perform the CONNECT/CONNACK handshake and start the network task
    pub async fn connect(&mut self) -> Result<()> {
        let mut eventloop = self.eventloop_slot().take().ok_or_else(|| {
            BridgeError::Connection(format!("{}: client already connected", self.broker))
        })?;

        let handshake =
            tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop, &self.broker))
                .await;

        let session_present = match handshake {
            Ok(Ok(session_present)) => session_present,
            Ok(Err(e)) => {
                *self.eventloop_slot() = Some(eventloop);
                return Err(e);
            }
            Err(_) => {
                *self.eventloop_slot() = Some(eventloop);
                return Err(BridgeError::Timeout(format!(
                    "no CONNACK from {} within {}s",
                    self.broker,
                    self.connect_timeout.as_secs()
                )));
            }
        };

        tracing::info!(broker = %self.broker, session_present, "Connected to MQTT broker");

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.events = Some(rx);
        self.forwarder = Some(tokio::spawn(forward_events(eventloop, tx)));
        Ok(())
    }

    /// Subscribe at QoS 1
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(topic, "Subscribe requested");
        Ok(())
    }

    /// Publish at QoS 1, not retained
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        publish_with(&self.client, topic, payload).await
    }

    /// Send the PUBACK for a handled message
    ///
    /// Acks are manual: the broker considers a QoS 1 message delivered only
    /// after this call, not when the network task first reads it.
    pub async fn ack(&self, message: &InboundMessage) -> Result<()> {
        let Some(pkid) = message.delivery_id else {
            return Ok(());
        };

        let mut publish = Publish::new(message.topic.as_str(), QoS::AtLeastOnce, Vec::new());
        publish.pkid = pkid;
        self.client
            .ack(&publish)
            .await
            .map_err(|e| BridgeError::Connection(format!("ack for packet {} failed: {}", pkid, e)))
    }

    /// Next forwarded event; `None` before `connect()` or after the network task ended
    pub async fn next_event(&mut self) -> Option<BusEvent> {
        self.events.as_mut()?.recv().await
    }

    /// Send DISCONNECT and wait briefly for the network task to flush it
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Unblocks a forwarder waiting on a full channel; it keeps polling
        // until the DISCONNECT is written.
        if let Some(mut events) = self.events.take() {
            events.close();
            while let Ok(event) = events.try_recv() {
                if let BusEvent::Message(message) = event {
                    log_unhandled(&message);
                }
            }
        }

        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "Disconnect request not delivered; event loop already stopped");
        }

        if let Some(mut handle) = self.forwarder.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                tracing::warn!(broker = %self.broker, "MQTT event loop did not stop in time");
                handle.abort();
            }
        }

        tracing::info!(broker = %self.broker, "MQTT disconnected");
        Ok(())
    }

    fn eventloop_slot(&mut self) -> &mut Option<EventLoop> {
        self.eventloop
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cloneable request handle
    pub fn async_client(&self) -> &AsyncClient {
        &self.client
    }

    /// Broker address as `host:port`
    pub fn broker(&self) -> &str {
        &self.broker
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if !self.closed && self.forwarder.is_some() {
            let _ = self.client.try_disconnect();
        }
    }
}

pub(super) async fn publish_with(client: &AsyncClient, topic: &str, payload: Vec<u8>) -> Result<()> {
    client
        .publish(topic, QoS::AtLeastOnce, false, payload)
        .await
        .map_err(|e| BridgeError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
}

/// Build rumqttc options from config
fn build_mqtt_options(config: &BridgeConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(
        config.client_id.clone(),
        config.broker_host.clone(),
        config.broker_port,
    );
    opts.set_keep_alive(config.keep_alive())
        .set_clean_session(true)
        .set_manual_acks(true)
        .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    opts
}

/// Poll until the broker answers CONNECT
async fn wait_for_connack(eventloop: &mut EventLoop, broker: &str) -> Result<bool> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if matches!(ack.code, ConnectReturnCode::Success) {
                    return Ok(ack.session_present);
                }
                return Err(refused(broker, ack.code));
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => return Err(refused(broker, code)),
            Err(e) => return Err(BridgeError::Connection(format!("{}: {}", broker, e))),
        }
    }
}

fn refused(broker: &str, code: ConnectReturnCode) -> BridgeError {
    BridgeError::Connection(format!(
        "{} refused the connection: {}",
        broker,
        describe_return_code(code)
    ))
}

/// Human-readable CONNACK return code
pub fn describe_return_code(code: ConnectReturnCode) -> &'static str {
    #[allow(unreachable_patterns)]
    match code {
        ConnectReturnCode::Success => "accepted",
        ConnectReturnCode::RefusedProtocolVersion => "unsupported protocol version",
        ConnectReturnCode::BadClientId => "client id rejected",
        ConnectReturnCode::ServiceUnavailable => "server unavailable",
        ConnectReturnCode::BadUserNamePassword => "bad user name or password",
        ConnectReturnCode::NotAuthorized => "not authorized",
        _ => "unknown reason",
    }
}

/// Network task: poll the event loop and forward what the bridge cares about
///
/// Once the receiver is gone the task keeps polling without forwarding, so
/// a pending DISCONNECT still reaches the broker.
async fn forward_events(mut eventloop: EventLoop, events: mpsc::Sender<BusEvent>) {
    let mut forwarding = true;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => BusEvent::Connected {
                session_present: ack.session_present,
            },
            Ok(Event::Incoming(Packet::SubAck(ack))) => BusEvent::Subscribed {
                accepted: ack
                    .return_codes
                    .iter()
                    .all(|code| !matches!(code, SubscribeReasonCode::Failure)),
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                BusEvent::Message(inbound_message(publish))
            }
            Ok(Event::Incoming(Packet::Disconnect)) => BusEvent::Disconnected {
                reason: "broker closed the session".to_string(),
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("DISCONNECT sent, stopping MQTT event loop");
                break;
            }
            Ok(_) => continue,
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                if !forwarding {
                    break;
                }
                let reason = e.to_string();
                if events.send(BusEvent::Disconnected { reason }).await.is_err() {
                    break;
                }
                tokio::time::sleep(RECONNECT_PAUSE).await;
                continue;
            }
        };

        if !forwarding {
            if let BusEvent::Message(message) = &event {
                log_unhandled(message);
            }
            continue;
        }

        if let Err(mpsc::error::SendError(event)) = events.send(event).await {
            forwarding = false;
            if let BusEvent::Message(message) = &event {
                log_unhandled(message);
            }
        }
    }
}

fn inbound_message(publish: Publish) -> InboundMessage {
    let message = InboundMessage::new(publish.topic, publish.payload);
    match publish.qos {
        QoS::AtMostOnce => message,
        _ => message.with_delivery_id(publish.pkid),
    }
}

/// A message read from the socket but never dispatched; it was not acked
fn log_unhandled(message: &InboundMessage) {
    tracing::warn!(
        topic = %message.topic,
        bytes = message.payload.len(),
        delivery_id = ?message.delivery_id,
        "Dropping undispatched message at shutdown (not acknowledged)"
    );
}
