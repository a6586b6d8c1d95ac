//! Bridge layer: the shared base (C8) plus the two concrete variants (C6, C7).

mod acp;
mod base;
mod stream_json;

pub use acp::AcpBridge;
pub use base::{BridgeCallbacks, BridgeConfig, BridgeCore};
pub use stream_json::StreamJsonBridge;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::Result;
use crate::types::{
    Attachment, BridgeState, Message, ProviderCapabilities, Response, SessionCapabilities,
    SessionInfo, Stats, ToolPolicy,
};

pub type TextStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// The contract every concrete agent adapter implements. `Engine` (C9) holds
/// one `Arc<dyn Bridge>` and never knows which variant it is driving.
///
/// `send_stream` takes `self: Arc<Self>` rather than `&self`: streaming a
/// turn spawns a task that outlives the call, and that task needs its own
/// owned handle on the bridge rather than borrowing one tied to the call's
/// stack frame.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    async fn send(&self, prompt: &str, attachments: &[Attachment]) -> Result<Response>;
    async fn send_stream(self: Arc<Self>, prompt: &str) -> Result<TextStream>;

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        Ok(Vec::new())
    }

    async fn resume_session(&self, _session_id: &str) -> Result<()> {
        Err(crate::error::BridgeError::NotFound(
            "this provider does not support resuming sessions".into(),
        ))
    }

    fn state(&self) -> BridgeState;
    fn session_id(&self) -> Option<String>;
    fn capabilities(&self) -> ProviderCapabilities;
    fn session_capabilities(&self) -> SessionCapabilities;

    fn history(&self) -> Vec<Message>;
    fn clear_history(&self);

    fn stats(&self) -> Stats;
    fn reset_stats(&self);

    fn tool_policy(&self) -> ToolPolicy;
    fn set_tool_policy(&self, policy: ToolPolicy);

    fn is_healthy(&self) -> bool;
    async fn check_health(&self) -> bool {
        self.is_healthy()
    }

    fn total_cost(&self) -> f64;
    fn is_over_budget(&self) -> bool;
}
