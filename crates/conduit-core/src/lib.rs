//! # conduit-core
//!
//! Headless runtime for multiplexing CLI-based AI agent subprocesses behind
//! one provider-agnostic conversation API. Applications embed this crate as
//! a library: it owns the lifecycle of the external agent subprocesses,
//! transports prompts and attachments to them, normalizes their
//! heterogeneous event streams into one typed taxonomy, and surfaces
//! conversation responses, tool-call activity, reasoning signals, cost,
//! diagnostics, and session-management operations.
//!
//! The hard part lives in [`bridge`] (the subprocess/protocol machinery for
//! each concrete agent backend) and [`engine`] (the composition of one
//! bridge instance with gating, restart, and the event bus).

pub mod activity;
pub mod bridge;
pub mod engine;
pub mod error;
pub mod events;
pub mod line_reader;
pub mod rate_limit;
pub mod sandbox;
pub mod session_store;
pub mod thinking;
pub mod tracing_utils;
pub mod types;

pub use bridge::{AcpBridge, Bridge, BridgeConfig, StreamJsonBridge, TextStream};
pub use engine::{Engine, EngineConfig};
pub use error::{BridgeError, Result};
pub use events::{Event, EventBus, EventKind, Handler, SubscriptionId, ThinkingPhase, ToolStatus};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use types::{
    Attachment, BridgeState, EngineState, Message, Provider, ProviderCapabilities, Response,
    Role, SessionCapabilities, SessionInfo, Stats, TokenUsage, ToolCallRecord, ToolPolicy,
};
