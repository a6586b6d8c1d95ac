//! Core data model: providers, bridge/engine state, messages, responses, sessions.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three concrete agent backends this runtime knows how to drive.
///
/// `StreamJson` speaks newline-delimited JSON over stdio and has no list/load
/// RPC of its own (session resume goes through `--resume`/`--continue` flags
/// plus the filesystem store as a read path). `AcpA` and `AcpB` speak the
/// Agent Client Protocol; they differ in authentication flow and in which
/// on-disk session dialect backs their filesystem fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    StreamJson,
    AcpA,
    AcpB,
}

impl Provider {
    /// Inline-vs-link-reference threshold for attachments, in bytes.
    ///
    /// A per-provider constant rather than a single global one, so a future
    /// provider with a different upload limit is a one-line change.
    pub fn inline_attachment_limit(self) -> u64 {
        20 * 1024 * 1024
    }

    pub fn is_acp(self) -> bool {
        matches!(self, Provider::AcpA | Provider::AcpB)
    }

    pub fn name(self) -> &'static str {
        match self {
            Provider::StreamJson => "stream-json",
            Provider::AcpA => "acp-a",
            Provider::AcpB => "acp-b",
        }
    }
}

/// Lifecycle state of a single bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Disconnected,
    WarmingUp,
    Ready,
    Busy,
    Error,
}

/// Coarser state surfaced to UIs, derived from bridge state plus in-flight
/// event activity; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Thinking,
    Responding,
    ToolExecuting,
    WaitingApproval,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_id: String,
    pub tool_name: String,
    pub parameters: serde_json::Value,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

/// An immutable reference to a file the caller wants attached to a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: PathBuf,
    pub mime_type: String,
    pub filename: String,
    pub size_bytes: u64,
}

impl Attachment {
    pub fn from_path(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> std::io::Result<Self> {
        let path = path.into();
        let size_bytes = std::fs::metadata(&path)?.len();
        let filename = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            path,
            mime_type: mime_type.into(),
            filename,
            size_bytes,
        })
    }

    pub fn mime_family(&self) -> &str {
        self.mime_type.split('/').next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The outcome of a single turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub success: bool,
    pub error: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub raw_events: Vec<serde_json::Value>,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub token_usage: Option<TokenUsage>,
    pub generated_images: Vec<PathBuf>,
}

impl Response {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            success: false,
            error: Some(error.into()),
            tool_calls: Vec::new(),
            raw_events: Vec::new(),
            duration_ms: 0,
            session_id: None,
            cost_usd: None,
            token_usage: None,
            generated_images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub provider: Provider,
    pub working_dir: PathBuf,
    pub title: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionCapabilities {
    pub can_list: bool,
    pub can_load: bool,
    pub can_continue_last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptMethod {
    Native,
    Injected,
    Unsupported,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub thinking_supported: bool,
    pub thinking_structured: bool,
    pub cost_tracking: bool,
    pub budget_enforcement: bool,
    pub system_prompt_method: SystemPromptMethod,
    pub streaming: bool,
    pub parallel_tool_calls: bool,
    pub cancellable: bool,
    pub mcp_supported: bool,
}

impl Provider {
    pub fn capabilities(self) -> ProviderCapabilities {
        match self {
            Provider::StreamJson => ProviderCapabilities {
                thinking_supported: true,
                thinking_structured: false,
                cost_tracking: true,
                budget_enforcement: true,
                system_prompt_method: SystemPromptMethod::Native,
                streaming: true,
                parallel_tool_calls: true,
                cancellable: false,
                mcp_supported: true,
            },
            Provider::AcpA | Provider::AcpB => ProviderCapabilities {
                thinking_supported: true,
                thinking_structured: true,
                cost_tracking: false,
                budget_enforcement: false,
                system_prompt_method: SystemPromptMethod::Injected,
                streaming: true,
                parallel_tool_calls: false,
                cancellable: false,
                mcp_supported: true,
            },
        }
    }
}

/// Allow/deny tool policy. Deny always wins; an empty `allow` set means "no
/// allowlist restriction" rather than "nothing is allowed".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPolicy {
    pub allow: HashSet<String>,
    pub deny: HashSet<String>,
}

impl ToolPolicy {
    pub fn is_permitted(&self, tool_name: &str) -> bool {
        if self.deny.contains(tool_name) {
            return false;
        }
        self.allow.is_empty() || self.allow.contains(tool_name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration_ms: u64,
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}
