//! Error types shared by the bridge and engine layers.

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while spawning, driving, or tearing down an agent bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Protocol-level errors surfaced by the `agent-client-protocol` SDK.
    #[error("Protocol error: {0}")]
    Protocol(#[from] agent_client_protocol::Error),

    /// IO errors from subprocess pipes, sandbox files, or session stores.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors for wire frames or session-store files.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Session creation, load, or resume failures.
    #[error("Session error: {0}")]
    Session(String),

    /// Subprocess spawn or pipe-setup failures.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A read or RPC call exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Engine or bridge configuration is internally inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sandbox or session-store filesystem errors that are not plain IO.
    #[error("File system error: {0}")]
    FileSystem(String),

    /// A tool invocation was refused by tool policy.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A requested session, tool, or resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Per-conversation budget has been exhausted.
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Escape hatch for errors without a dedicated variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
