//! Dialect B: the first ACP agent's on-disk session documents.
//!
//! Layout: `~/.<agent>/tmp/<sha256(cwd)>/chats/session-*.json`, each file a
//! single JSON document with `sessionId`, `lastUpdated|startTime`, and a
//! `messages` array whose items carry `type ∈ {user, gemini, error}`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::{Message, Provider, Role, SessionInfo};

use super::{truncate_title, SessionStore};

pub struct DialectBStore {
    agent_dir_name: String,
}

impl DialectBStore {
    pub fn new(agent_dir_name: impl Into<String>) -> Self {
        Self {
            agent_dir_name: agent_dir_name.into(),
        }
    }

    fn hash_cwd(cwd: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(cwd.to_string_lossy().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn chats_dir(&self, cwd: &Path) -> Option<PathBuf> {
        let home = std::env::var_os("HOME").map(PathBuf::from)?;
        Some(
            home.join(format!(".{}", self.agent_dir_name))
                .join("tmp")
                .join(Self::hash_cwd(cwd))
                .join("chats"),
        )
    }
}

fn parse_timestamp(doc: &serde_json::Value) -> Option<DateTime<Utc>> {
    let raw = doc
        .get("lastUpdated")
        .or_else(|| doc.get("startTime"))
        .and_then(|v| v.as_str())?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn first_user_text(doc: &serde_json::Value) -> Option<String> {
    let messages = doc.get("messages")?.as_array()?;
    for item in messages {
        if item.get("type").and_then(|t| t.as_str()) == Some("user") {
            if let Some(text) = item.get("content").and_then(|c| c.as_str()) {
                if !text.trim().is_empty() {
                    return Some(text.to_string());
                }
            }
        }
    }
    None
}

#[async_trait]
impl SessionStore for DialectBStore {
    async fn list_sessions(&self, working_dir: &Path) -> Result<Vec<SessionInfo>> {
        let Some(dir) = self.chats_dir(working_dir) else {
            return Ok(Vec::new());
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(doc) = serde_json::from_str::<serde_json::Value>(&content) else {
                continue;
            };
            let Some(session_id) = doc.get("sessionId").and_then(|v| v.as_str()) else {
                continue;
            };

            // Resolved open question: when no real user message precedes the
            // session (e.g. a loaded-but-never-messaged session), fall back
            // to the session id itself rather than leaving the title absent.
            let title = first_user_text(&doc)
                .map(|t| truncate_title(&t))
                .or_else(|| Some(truncate_title(session_id)));

            sessions.push(SessionInfo {
                session_id: session_id.to_string(),
                provider: Provider::AcpA,
                working_dir: working_dir.to_path_buf(),
                title,
                updated_at: parse_timestamp(&doc),
            });
        }

        sessions.sort_by(|a, b| match (a.updated_at, b.updated_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        Ok(sessions)
    }

    async fn load_session_messages(&self, session_id: &str, working_dir: &Path) -> Result<Vec<Message>> {
        let Some(dir) = self.chats_dir(working_dir) else {
            return Ok(Vec::new());
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        // Resolve by filename containing the first 8 hex chars of the id,
        // then confirm via the document's own `sessionId` field.
        let prefix = &session_id[..session_id.len().min(8)];
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.contains(prefix) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(doc) = serde_json::from_str::<serde_json::Value>(&content) else {
                continue;
            };
            if doc.get("sessionId").and_then(|v| v.as_str()) != Some(session_id) {
                continue;
            }

            let mut messages = Vec::new();
            if let Some(items) = doc.get("messages").and_then(|m| m.as_array()) {
                for item in items {
                    let kind = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
                    let role = match kind {
                        "user" => Role::User,
                        "gemini" => Role::Assistant,
                        _ => continue,
                    };
                    let Some(text) = item.get("content").and_then(|c| c.as_str()) else {
                        continue;
                    };
                    messages.push(Message {
                        role,
                        content: text.to_string(),
                        timestamp: Utc::now(),
                        tool_calls: Vec::new(),
                        attachments: Vec::new(),
                    });
                }
            }
            return Ok(messages);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_doc(dir: &Path, filename: &str, doc: &serde_json::Value) {
        std::fs::write(dir.join(filename), serde_json::to_string_pretty(doc).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn round_trips_a_synthetic_session() {
        let home = TempDir::new().unwrap();
        std::env::set_var("HOME", home.path());
        let store = DialectBStore::new("acp-a-agent");
        let cwd = PathBuf::from("/work/project-b");

        let chats_dir = home
            .path()
            .join(".acp-a-agent")
            .join("tmp")
            .join(DialectBStore::hash_cwd(&cwd))
            .join("chats");
        std::fs::create_dir_all(&chats_dir).unwrap();

        write_doc(
            &chats_dir,
            "session-abcdef01.json",
            &serde_json::json!({
                "sessionId": "abcdef01-2345",
                "lastUpdated": "2026-01-01T00:00:00Z",
                "messages": [
                    {"type": "user", "content": "what's the weather"},
                    {"type": "gemini", "content": "sunny"},
                ]
            }),
        );

        let sessions = store.list_sessions(&cwd).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title.as_deref(), Some("what's the weather"));

        let messages = store
            .load_session_messages("abcdef01-2345", &cwd)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn falls_back_to_session_id_title_when_no_user_message() {
        let home = TempDir::new().unwrap();
        std::env::set_var("HOME", home.path());
        let store = DialectBStore::new("acp-a-agent");
        let cwd = PathBuf::from("/work/project-c");

        let chats_dir = home
            .path()
            .join(".acp-a-agent")
            .join("tmp")
            .join(DialectBStore::hash_cwd(&cwd))
            .join("chats");
        std::fs::create_dir_all(&chats_dir).unwrap();

        write_doc(
            &chats_dir,
            "session-fedcba98.json",
            &serde_json::json!({
                "sessionId": "fedcba98-0000",
                "startTime": "2026-01-01T00:00:00Z",
                "messages": []
            }),
        );

        let sessions = store.list_sessions(&cwd).await.unwrap();
        assert_eq!(sessions[0].title.as_deref(), Some("fedcba98-0000"));
    }
}
