//! Message dispatcher — one inbound payload in, exactly one envelope out
//!
//! Every failure between decoding the payload and encoding the reply is
//! caught here and turned into an error envelope, so a malformed message
//! never takes the event loop down.

use crate::agent::AgentRunner;
use crate::error::Result;
use crate::provider::Publisher;
use crate::types::{InboundCommand, PayloadFormat, ResponseEnvelope, StatusPolicy};
use std::sync::Arc;

/// Processes inbound payloads and publishes their envelopes
///
/// Cheap to clone; the agent runner is shared.
#[derive(Clone)]
pub struct Dispatcher {
    agent: Arc<dyn AgentRunner>,
    outbound_topic: String,
    status_policy: StatusPolicy,
}

impl Dispatcher {
    pub fn new(
        agent: Arc<dyn AgentRunner>,
        outbound_topic: impl Into<String>,
        status_policy: StatusPolicy,
    ) -> Self {
        Self {
            agent,
            outbound_topic: outbound_topic.into(),
            status_policy,
        }
    }

    pub fn outbound_topic(&self) -> &str {
        &self.outbound_topic
    }

    pub fn status_policy(&self) -> StatusPolicy {
        self.status_policy
    }

    /// Handle one payload and publish the resulting envelope
    ///
    /// Returns the envelope that was (or failed to be) published. A publish
    /// failure is logged and not retried: the inbound message is already
    /// consumed.
    pub async fn dispatch(&self, publisher: &dyn Publisher, payload: &[u8]) -> ResponseEnvelope {
        let (envelope, body) = self.process(payload).await;

        match publisher.publish(&self.outbound_topic, body.into_bytes()).await {
            Ok(()) => tracing::info!(
                topic = %self.outbound_topic,
                status = %envelope.status,
                request_id = ?envelope.request_id,
                "Published response"
            ),
            Err(e) => tracing::error!(
                topic = %self.outbound_topic,
                request_id = ?envelope.request_id,
                error = %e,
                "Failed to publish response"
            ),
        }

        envelope
    }

    /// Build the envelope for a payload together with its JSON encoding
    pub async fn process(&self, payload: &[u8]) -> (ResponseEnvelope, String) {
        let encoded = match self.build_reply(payload).await {
            Ok(envelope) => envelope.to_json().map(|body| (envelope, body)),
            Err(e) => Err(e),
        };

        match encoded {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "Failed to process message");
                let envelope = ResponseEnvelope::failure(e.to_string());
                let body = envelope.to_json().unwrap_or_else(|_| fallback_error_body(&envelope));
                (envelope, body)
            }
        }
    }

    async fn build_reply(&self, payload: &[u8]) -> Result<ResponseEnvelope> {
        let command = InboundCommand::from_payload(payload)?;
        if command.format == PayloadFormat::Text {
            tracing::debug!("Payload is plain text (not JSON)");
        }

        tracing::info!(
            agent = self.agent.name(),
            request_id = ?command.request_id,
            "Calling agent"
        );
        let reply = self.agent.run(&command.message).await;

        Ok(ResponseEnvelope::reply(&command, &reply, self.status_policy))
    }
}

/// Hand-built error body for the (unreachable in practice) case where the
/// error envelope itself cannot be encoded
fn fallback_error_body(envelope: &ResponseEnvelope) -> String {
    serde_json::json!({
        "timestamp": envelope.timestamp,
        "status": "error",
        "error": envelope.error,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::BusProvider;
    use crate::types::{AgentReply, Status};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies with a fixed answer and records every instruction
    struct ScriptedAgent {
        reply: AgentReply,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedAgent {
        fn new(reply: AgentReply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedAgent {
        async fn run(&self, message: &str) -> AgentReply {
            self.seen.lock().unwrap().push(message.to_string());
            self.reply.clone()
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn dispatcher(agent: Arc<ScriptedAgent>, policy: StatusPolicy) -> Dispatcher {
        Dispatcher::new(agent, "out", policy)
    }

    #[tokio::test]
    async fn test_json_command_roundtrip() {
        let agent = ScriptedAgent::new(AgentReply::success("pong"));
        let (provider, handle) = MemoryProvider::pair();
        let d = dispatcher(agent.clone(), StatusPolicy::NonEmpty);

        let env = d
            .dispatch(provider.publisher().as_ref(), br#"{"message":"ping","request_id":"r1"}"#)
            .await;

        assert_eq!(env.status, Status::Success);
        assert_eq!(*agent.seen.lock().unwrap(), vec!["ping".to_string()]);

        let published = handle.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "out");
        let json = published[0].json().unwrap();
        assert_eq!(json["request_id"], "r1");
        assert_eq!(json["message"], "ping");
        assert_eq!(json["response"], "pong");
        assert_eq!(json["status"], "success");
    }

    #[tokio::test]
    async fn test_plain_text_command() {
        let agent = ScriptedAgent::new(AgentReply::success("pong"));
        let (envelope, body) = dispatcher(agent, StatusPolicy::NonEmpty).process(b"ping").await;

        assert_eq!(envelope.message.as_deref(), Some("ping"));
        assert!(envelope.request_id.is_none());
        assert_eq!(envelope.response.as_deref(), Some("pong"));
        assert!(!body.contains("request_id"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_yields_error_envelope_without_calling_agent() {
        let agent = ScriptedAgent::new(AgentReply::success("pong"));
        let (envelope, body) = dispatcher(agent.clone(), StatusPolicy::NonEmpty)
            .process(&[0xc3, 0x28])
            .await;

        assert_eq!(envelope.status, Status::Error);
        assert!(envelope.error.as_deref().unwrap().contains("UTF-8"));
        assert!(envelope.message.is_none());
        assert!(envelope.response.is_none());
        assert!(agent.seen.lock().unwrap().is_empty());

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "error");
        assert!(json.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_failed_run_under_both_policies() {
        let reply = AgentReply::failure("Error: OpenClaw command timed out (over 5 minutes).");

        let (legacy, _) = dispatcher(ScriptedAgent::new(reply.clone()), StatusPolicy::NonEmpty)
            .process(b"slow")
            .await;
        assert_eq!(legacy.status, Status::Success);
        assert!(legacy.response.as_deref().unwrap().contains("timed out"));

        let (strict, _) = dispatcher(ScriptedAgent::new(reply), StatusPolicy::Outcome)
            .process(b"slow")
            .await;
        assert_eq!(strict.status, Status::Error);
        assert!(strict.error.is_none());
    }

    #[tokio::test]
    async fn test_empty_reply_is_error_status() {
        let (env, _) = dispatcher(ScriptedAgent::new(AgentReply::success("")), StatusPolicy::NonEmpty)
            .process(b"hi")
            .await;
        assert_eq!(env.status, Status::Error);
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let (provider, handle) = MemoryProvider::pair();
        handle.set_publish_failure(true);

        let env = dispatcher(ScriptedAgent::new(AgentReply::success("pong")), StatusPolicy::NonEmpty)
            .dispatch(provider.publisher().as_ref(), b"ping")
            .await;

        assert!(env.is_success());
        assert!(handle.published().is_empty());
    }
}
