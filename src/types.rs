//! Core message types for the bridge
//!
//! The outbound envelope keeps snake_case field names: devices on the
//! response topic already parse `request_id`, so the wire shape is fixed.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// How an inbound payload was interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// JSON object carrying `message` / `request_id`
    Json,
    /// Anything else; the whole payload is the message
    Text,
}

/// An instruction received on the inbound topic
///
/// Lives only for the duration of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    /// Instruction text handed to the agent
    pub message: String,

    /// Caller-chosen correlation id, echoed back verbatim in whatever JSON
    /// form it arrived (string, number, object, ...)
    pub request_id: Option<Value>,

    /// Input mode the payload was decoded with
    pub format: PayloadFormat,
}

impl InboundCommand {
    /// Build a plain-text command with no correlation id
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request_id: None,
            format: PayloadFormat::Text,
        }
    }

    /// Decode raw payload bytes
    ///
    /// Non-UTF-8 payloads are a decode error. Payloads that are not a JSON
    /// object are not an error: they are taken verbatim as the message.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| BridgeError::Decode(format!("payload is not valid UTF-8: {}", e)))?;
        Self::from_text(text)
    }

    /// Decode an already UTF-8 payload
    pub fn from_text(text: &str) -> Result<Self> {
        let fields = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => fields,
            _ => return Ok(Self::text(text)),
        };

        let message = match fields.get("message") {
            None | Some(Value::Null) => text.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(BridgeError::Decode(format!(
                    "field 'message' must be a string, got {}",
                    json_kind(other)
                )))
            }
        };

        let request_id = fields.get("request_id").filter(|id| !id.is_null()).cloned();

        Ok(Self {
            message,
            request_id,
            format: PayloadFormat::Json,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Text answer from an agent run plus whether the run itself succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    /// Extracted answer, or a deterministic `Error: ...` description
    pub text: String,

    /// False on timeout, non-zero exit, or spawn failure
    pub succeeded: bool,
}

impl AgentReply {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            succeeded: true,
        }
    }

    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            succeeded: false,
        }
    }
}

/// Envelope status field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => f.write_str("success"),
            Status::Error => f.write_str("error"),
        }
    }
}

/// Rule deciding the `status` of a reply envelope
///
/// `NonEmpty` is the established contract: any non-empty response text is
/// reported as `success`, including embedded `Error: ...` strings from
/// timeouts and failed runs. `Outcome` reports the agent run's own result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusPolicy {
    #[default]
    NonEmpty,
    Outcome,
}

impl StatusPolicy {
    /// Status for a reply under this policy
    pub fn resolve(self, reply: &AgentReply) -> Status {
        let ok = match self {
            StatusPolicy::NonEmpty => !reply.text.is_empty(),
            StatusPolicy::Outcome => reply.succeeded,
        };
        if ok {
            Status::Success
        } else {
            Status::Error
        }
    }
}

impl FromStr for StatusPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "non-empty" | "nonempty" | "legacy" => Ok(StatusPolicy::NonEmpty),
            "outcome" | "agent-outcome" => Ok(StatusPolicy::Outcome),
            other => Err(BridgeError::Config(format!(
                "unknown status policy '{}' (expected 'non-empty' or 'outcome')",
                other
            ))),
        }
    }
}

impl fmt::Display for StatusPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusPolicy::NonEmpty => f.write_str("non-empty"),
            StatusPolicy::Outcome => f.write_str("outcome"),
        }
    }
}

/// Response published on the outbound topic, one per inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Local time, RFC 3339 with microseconds
    pub timestamp: String,

    /// Correlation id from the command, unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,

    /// Inbound instruction, echoed verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Agent output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    pub status: Status,

    /// Processing failure text (error envelopes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Envelope for a processed command
    pub fn reply(command: &InboundCommand, reply: &AgentReply, policy: StatusPolicy) -> Self {
        Self {
            timestamp: now_iso8601(),
            request_id: command.request_id.clone(),
            message: Some(command.message.clone()),
            response: Some(reply.text.clone()),
            status: policy.resolve(reply),
            error: None,
        }
    }

    /// Envelope for a message that could not be processed
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            timestamp: now_iso8601(),
            request_id: None,
            message: None,
            response: None,
            status: Status::Error,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Encode as JSON; non-ASCII text is written as-is, not `\u` escaped
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn now_iso8601() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
