//! Dialect C: the second ACP agent's rollout logs.
//!
//! Layout: `~/.<agent>/sessions/YYYY/MM/DD/rollout-<ts>-<id>.jsonl`. The
//! first line is a `session_meta` event exposing `id`, `cwd`, `timestamp`;
//! subsequent `response_item` events carry `payload.role ∈ {user,
//! assistant}` and `payload.content[].type ∈ {input_text, output_text}`.
//! Synthetic system/developer blocks are filtered out.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Message, Provider, Role, SessionInfo};

use super::{truncate_title, SessionStore};

pub struct DialectCStore {
    agent_dir_name: String,
}

impl DialectCStore {
    pub fn new(agent_dir_name: impl Into<String>) -> Self {
        Self {
            agent_dir_name: agent_dir_name.into(),
        }
    }

    fn sessions_root(&self) -> Option<PathBuf> {
        let home = std::env::var_os("HOME").map(PathBuf::from)?;
        Some(home.join(format!(".{}", self.agent_dir_name)).join("sessions"))
    }

    fn walk_rollout_files(&self) -> Vec<PathBuf> {
        let Some(root) = self.sessions_root() else {
            return Vec::new();
        };
        let mut files = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("rollout-") && n.ends_with(".jsonl"))
                    .unwrap_or(false)
                {
                    files.push(path);
                }
            }
        }
        files
    }
}

fn is_synthetic_block(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('<') || trimmed.starts_with("# AGENTS.md")
}

fn extract_text_blocks(payload: &serde_json::Value, content_type: &str) -> Option<String> {
    let blocks = payload.get("content")?.as_array()?;
    let mut text = String::new();
    for block in blocks {
        if block.get("type").and_then(|t| t.as_str()) == Some(content_type) {
            if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                text.push_str(t);
            }
        }
    }
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

struct ParsedRollout {
    id: String,
    cwd: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    messages: Vec<Message>,
    title: Option<String>,
}

fn parse_rollout(path: &Path) -> Option<ParsedRollout> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut lines = content.lines();

    let meta_line = lines.next()?;
    let meta: serde_json::Value = serde_json::from_str(meta_line).ok()?;
    let meta_payload = meta.get("payload").unwrap_or(&meta);
    let id = meta_payload.get("id").and_then(|v| v.as_str())?.to_string();
    let cwd = meta_payload
        .get("cwd")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let timestamp = meta_payload
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let mut messages = Vec::new();
    let mut title = None;

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if event.get("type").and_then(|t| t.as_str()) != Some("response_item") {
            continue;
        }
        let Some(payload) = event.get("payload") else {
            continue;
        };
        let role = match payload.get("role").and_then(|r| r.as_str()) {
            Some("user") => Role::User,
            Some("assistant") => Role::Assistant,
            _ => continue,
        };
        let text = match role {
            Role::User => extract_text_blocks(payload, "input_text"),
            Role::Assistant => extract_text_blocks(payload, "output_text"),
        };
        let Some(text) = text else { continue };
        if is_synthetic_block(&text) {
            continue;
        }
        if title.is_none() && role == Role::User {
            title = Some(truncate_title(&text));
        }
        messages.push(Message {
            role,
            content: text,
            timestamp: timestamp.unwrap_or_else(Utc::now),
            tool_calls: Vec::new(),
            attachments: Vec::new(),
        });
    }

    Some(ParsedRollout {
        id,
        cwd,
        timestamp,
        messages,
        title,
    })
}

#[async_trait]
impl SessionStore for DialectCStore {
    async fn list_sessions(&self, working_dir: &Path) -> Result<Vec<SessionInfo>> {
        let target_cwd = working_dir.to_string_lossy().into_owned();
        let mut sessions = Vec::new();
        for path in self.walk_rollout_files() {
            let Some(parsed) = parse_rollout(&path) else {
                continue;
            };
            if parsed.cwd.as_deref() != Some(target_cwd.as_str()) {
                continue;
            }
            sessions.push(SessionInfo {
                session_id: parsed.id,
                provider: Provider::AcpB,
                working_dir: working_dir.to_path_buf(),
                title: parsed.title,
                updated_at: parsed.timestamp,
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

    async fn load_session_messages(&self, session_id: &str, _working_dir: &Path) -> Result<Vec<Message>> {
        for path in self.walk_rollout_files() {
            let Some(parsed) = parse_rollout(&path) else {
                continue;
            };
            if parsed.id == session_id {
                return Ok(parsed.messages);
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_rollout(path: &Path, lines: &[&str]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    #[tokio::test]
    async fn round_trips_a_synthetic_session_and_filters_synthetic_blocks() {
        let home = TempDir::new().unwrap();
        std::env::set_var("HOME", home.path());
        let store = DialectCStore::new("acp-b-agent");
        let cwd = PathBuf::from("/work/project-d");

        let path = home
            .path()
            .join(".acp-b-agent")
            .join("sessions")
            .join("2026")
            .join("01")
            .join("01")
            .join("rollout-20260101-sess3.jsonl");

        write_rollout(
            &path,
            &[
                r#"{"type":"session_meta","payload":{"id":"sess3","cwd":"/work/project-d","timestamp":"2026-01-01T12:00:00Z"}}"#,
                r#"{"type":"response_item","payload":{"role":"user","content":[{"type":"input_text","text":"<environment_details>ignore me</environment_details>"}]}}"#,
                r#"{"type":"response_item","payload":{"role":"user","content":[{"type":"input_text","text":"real question"}]}}"#,
                r#"{"type":"response_item","payload":{"role":"assistant","content":[{"type":"output_text","text":"real answer"}]}}"#,
            ],
        );

        let sessions = store.list_sessions(&cwd).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title.as_deref(), Some("real question"));

        let messages = store.load_session_messages("sess3", &cwd).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "real question");
        assert_eq!(messages[1].content, "real answer");
    }
}
