//! # a3s-agent-bridge
//!
//! Bridges an MQTT topic to a local command-line agent.
//!
//! ## Overview
//!
//! The bridge subscribes to an inbound topic. Each message (a JSON object
//! `{"message": ..., "request_id": ...}` or plain text) is handed to the
//! agent executable as a single argument; the agent's answer is published
//! to the outbound topic as a JSON envelope echoing `message` and
//! `request_id`. Messages are handled strictly one at a time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_agent_bridge::{Bridge, BridgeConfig, CommandAgent, MqttProvider};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_agent_bridge::Result<()> {
//! let config = BridgeConfig::from_env()?;
//! let provider = MqttProvider::new(&config);
//! let agent = Arc::new(CommandAgent::new(config.agent.clone()));
//!
//! let mut bridge = Bridge::new(config, provider, agent);
//! bridge.connect().await?;
//! bridge.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **BusProvider** / **Publisher** traits — bus backends (MQTT, in-memory)
//! - **Bridge** — connection state machine and serialized event loop
//! - **Dispatcher** — payload → agent → envelope → publish, never panics out
//! - **AgentRunner** trait — how an instruction becomes a reply
//! - **ResponseEnvelope** — the outbound wire format

pub mod agent;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod probe;
pub mod provider;
pub mod types;

// Re-export core types
pub use agent::{AgentInvocation, AgentRunner, CommandAgent, InvocationOutcome};
pub use bridge::{Bridge, ConnectionState};
pub use config::{AgentConfig, BridgeConfig};
pub use dispatch::Dispatcher;
pub use error::{BridgeError, Result};
pub use provider::{BusEvent, BusProvider, InboundMessage, Publisher};
pub use types::{AgentReply, InboundCommand, PayloadFormat, ResponseEnvelope, Status, StatusPolicy};

// Re-export providers for convenience
pub use provider::memory::{MemoryConfig, MemoryHandle, MemoryProvider};
pub use provider::mqtt::{MqttClient, MqttProvider};
