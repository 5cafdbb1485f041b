//! Error types for a3s-agent-bridge

use thiserror::Error;

/// Errors that can occur while bridging the bus and the agent
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Broker unreachable, handshake refused, or session lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe {
        topic: String,
        reason: String,
    },

    /// Publish failure
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish {
        topic: String,
        reason: String,
    },

    /// Inbound payload could not be turned into a command
    #[error("Decode error: {0}")]
    Decode(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Agent process could not be run
    #[error("Agent error: {0}")]
    Agent(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
