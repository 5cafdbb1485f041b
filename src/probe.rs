//! Connectivity diagnostics for the `check` command
//!
//! `probe_bus` connects with a throwaway client id, subscribes to a private
//! topic, publishes to it and waits for the message to come back.
//! `probe_agent` asks the agent executable for its version. `dry_run` sends
//! one instruction straight to the agent, without a broker, and returns the
//! envelope the bridge would publish.

use crate::agent::AgentRunner;
use crate::config::AgentConfig;
use crate::dispatch::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::provider::{BusEvent, BusProvider};
use crate::types::{ResponseEnvelope, StatusPolicy};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

const PROBE_PAYLOAD: &[u8] = b"a3s-agent-bridge check";
const AGENT_VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timings from a successful bus probe
#[derive(Debug, Clone, Copy)]
pub struct BusProbeReport {
    /// CONNECT → CONNACK
    pub connect: Duration,
    /// SUBSCRIBE → SUBACK
    pub subscribe: Duration,
    /// PUBLISH → message delivered back
    pub round_trip: Duration,
}

/// Unique client id for probe and harness sessions
pub fn probe_client_id(purpose: &str) -> String {
    format!("a3s_bridge_{}_{}", purpose, uuid::Uuid::new_v4().simple())
}

/// Unique topic used for the round-trip check
pub fn probe_topic() -> String {
    format!("a3s-agent-bridge/check/{}", uuid::Uuid::new_v4().simple())
}

/// Connect, subscribe, publish and receive on `topic`, then disconnect
pub async fn probe_bus(
    provider: &mut dyn BusProvider,
    topic: &str,
    timeout: Duration,
) -> Result<BusProbeReport> {
    let started = Instant::now();
    provider.connect().await?;
    let connect = started.elapsed();

    let result = tokio::time::timeout(timeout, exchange(provider, topic))
        .await
        .unwrap_or_else(|_| {
            Err(BridgeError::Timeout(format!(
                "no round trip on '{}' within {}s",
                topic,
                timeout.as_secs()
            )))
        });

    if let Err(e) = provider.disconnect().await {
        tracing::warn!(error = %e, "Probe disconnect failed");
    }

    let (subscribe, round_trip) = result?;
    Ok(BusProbeReport {
        connect,
        subscribe,
        round_trip,
    })
}

async fn exchange(provider: &mut dyn BusProvider, topic: &str) -> Result<(Duration, Duration)> {
    let started = Instant::now();
    provider.subscribe(topic).await?;

    let subscribe = loop {
        match provider.next_event().await {
            Some(BusEvent::Subscribed { accepted: true }) => break started.elapsed(),
            Some(BusEvent::Subscribed { accepted: false }) => {
                return Err(BridgeError::Subscribe {
                    topic: topic.to_string(),
                    reason: "rejected by broker".to_string(),
                })
            }
            Some(_) => continue,
            None => return Err(BridgeError::Connection("event stream ended".to_string())),
        }
    };

    let sent = Instant::now();
    provider.publish(topic, PROBE_PAYLOAD.to_vec()).await?;

    loop {
        match provider.next_event().await {
            Some(BusEvent::Message(message)) if message.topic == topic => {
                let round_trip = sent.elapsed();
                provider.ack(&message).await?;
                return Ok((subscribe, round_trip));
            }
            Some(BusEvent::Disconnected { reason }) => {
                return Err(BridgeError::Connection(reason))
            }
            Some(_) => continue,
            None => return Err(BridgeError::Connection("event stream ended".to_string())),
        }
    }
}

/// Run `<exe> --version` and return the first line of its output
pub async fn probe_agent(config: &AgentConfig) -> Result<String> {
    let mut cmd = Command::new(&config.executable);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(AGENT_VERSION_TIMEOUT, cmd.output())
        .await
        .map_err(|_| {
            BridgeError::Timeout(format!("{} --version did not finish", config.executable))
        })?
        .map_err(|e| BridgeError::Agent(format!("{}: {}", config.executable, e)))?;

    if !output.status.success() {
        return Err(BridgeError::Agent(format!(
            "{} --version exited with {}: {}",
            config.executable,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.trim().lines().next().unwrap_or_default().to_string())
}

/// Decode `payload` as an inbound instruction, run it through the agent and
/// return the envelope with its JSON body. Nothing is published.
pub async fn dry_run(
    agent: Arc<dyn AgentRunner>,
    payload: &str,
    policy: StatusPolicy,
) -> (ResponseEnvelope, String) {
    Dispatcher::new(agent, String::new(), policy)
        .process(payload.as_bytes())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{MemoryConfig, MemoryProvider};
    use crate::types::{AgentReply, Status};
    use async_trait::async_trait;

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

    #[test]
    fn test_probe_ids_are_unique() {
        let a = probe_client_id("check");
        let b = probe_client_id("check");
        assert!(a.starts_with("a3s_bridge_check_"));
        assert_ne!(a, b);
        assert!(probe_topic().starts_with("a3s-agent-bridge/check/"));
    }

    #[tokio::test]
    async fn test_probe_bus_round_trip() {
        let (mut provider, handle) = MemoryProvider::pair();
        let topic = probe_topic();
        handle.deliver(&topic, PROBE_PAYLOAD);

        let report = probe_bus(&mut provider, &topic, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(report.round_trip <= Duration::from_secs(2));
        assert_eq!(handle.published()[0].topic, topic);
        assert_eq!(handle.acked(), vec![1]);
        assert_eq!(handle.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_probe_bus_times_out_without_echo() {
        let (mut provider, handle) = MemoryProvider::pair();
        let err = probe_bus(&mut provider, "silent", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert_eq!(handle.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_probe_bus_refused() {
        let (mut provider, _handle) = MemoryProvider::new(MemoryConfig {
            refuse_connect: true,
        });
        let err = probe_bus(&mut provider, "t", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
    }

    #[tokio::test]
    async fn test_probe_agent_missing_executable() {
        let config = AgentConfig {
            executable: "/nonexistent/a3s-agent-bridge-probe".to_string(),
            ..Default::default()
        };
        let err = probe_agent(&config).await.unwrap_err();
        assert!(matches!(err, BridgeError::Agent(_)));
    }

    #[tokio::test]
    async fn test_dry_run_plain_text() {
        let (envelope, body) = dry_run(Arc::new(EchoAgent), "hello", StatusPolicy::NonEmpty).await;
        assert_eq!(envelope.status, Status::Success);
        assert_eq!(envelope.message.as_deref(), Some("hello"));
        assert_eq!(envelope.response.as_deref(), Some("echo: hello"));
        assert!(envelope.request_id.is_none());

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["response"], "echo: hello");
    }

    #[tokio::test]
    async fn test_dry_run_json_keeps_request_id() {
        let (envelope, _) = dry_run(
            Arc::new(EchoAgent),
            r#"{"message":"ping","request_id":7}"#,
            StatusPolicy::Outcome,
        )
        .await;
        assert_eq!(envelope.request_id, Some(serde_json::json!(7)));
        assert_eq!(envelope.response.as_deref(), Some("echo: ping"));
    }
}
