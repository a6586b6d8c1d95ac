//! Read-only filesystem session stores (C2): the fallback list/load path for
//! agents that have no (or an unreliable) list/load RPC of their own.

mod dialect_a;
mod dialect_b;
mod dialect_c;

pub use dialect_a::DialectAStore;
pub use dialect_b::DialectBStore;
pub use dialect_c::DialectCStore;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Message, SessionInfo};

pub const TITLE_MAX_LEN: usize = 80;

pub(crate) fn truncate_title(s: &str) -> String {
    if s.chars().count() <= TITLE_MAX_LEN {
        s.to_string()
    } else {
        s.chars().take(TITLE_MAX_LEN).collect()
    }
}

/// A read-only on-disk session history reader for one agent's own file layout.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Newest-first; entries with no known timestamp sort last.
    async fn list_sessions(&self, working_dir: &Path) -> Result<Vec<SessionInfo>>;

    /// Reconstructs the user/assistant turns of one session, in order.
    async fn load_session_messages(&self, session_id: &str, working_dir: &Path) -> Result<Vec<Message>>;
}
