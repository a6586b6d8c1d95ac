//! Dialect A: the stream-JSON agent's on-disk session log.
//!
//! Layout: `~/.<agent>/projects/<encoded-cwd>/<uuid>.jsonl`, where
//! `encoded-cwd` is the absolute working directory with `/` replaced by `-`.
//! Each line is one typed event; a session's title is its first user
//! message's text, skipping synthetic "interrupted" markers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Message, Provider, Role, SessionInfo};

use super::{truncate_title, SessionStore};

pub struct DialectAStore {
    agent_dir_name: String,
}

impl DialectAStore {
    pub fn new(agent_dir_name: impl Into<String>) -> Self {
        Self {
            agent_dir_name: agent_dir_name.into(),
        }
    }

    fn encode_cwd(cwd: &Path) -> String {
        cwd.to_string_lossy().replace('/', "-")
    }

    fn project_dir(&self, cwd: &Path) -> Option<PathBuf> {
        let home = dirs_home()?;
        Some(
            home.join(format!(".{}", self.agent_dir_name))
                .join("projects")
                .join(Self::encode_cwd(cwd)),
        )
    }

    fn session_id_from_path(path: &Path) -> Option<String> {
        path.file_stem().map(|s| s.to_string_lossy().into_owned())
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn mtime_utc(path: &Path) -> Option<DateTime<Utc>> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// Extracts the first text block's content from a stream-JSON line event,
/// if the line represents a message of the given role.
fn extract_text(line: &serde_json::Value, role: &str) -> Option<String> {
    let msg = line.get("message")?;
    if msg.get("role").and_then(|r| r.as_str()) != Some(role) {
        return None;
    }
    let content = msg.get("content")?.as_array()?;
    let mut text = String::new();
    for block in content {
        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
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

fn is_interrupted_marker(text: &str) -> bool {
    text.trim_start().starts_with("[Request interrupted")
}

#[async_trait]
impl SessionStore for DialectAStore {
    async fn list_sessions(&self, working_dir: &Path) -> Result<Vec<SessionInfo>> {
        let Some(dir) = self.project_dir(working_dir) else {
            return Ok(Vec::new());
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(session_id) = Self::session_id_from_path(&path) else {
                continue;
            };
            let title = find_title(&path);
            sessions.push(SessionInfo {
                session_id,
                provider: Provider::StreamJson,
                working_dir: working_dir.to_path_buf(),
                title,
                updated_at: mtime_utc(&path),
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
        let Some(dir) = self.project_dir(working_dir) else {
            return Ok(Vec::new());
        };
        let path = dir.join(format!("{session_id}.jsonl"));
        if !path.is_file() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&path)?;
        let mut messages = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if let Some(text) = extract_text(&value, "user") {
                if !is_interrupted_marker(&text) {
                    messages.push(Message {
                        role: Role::User,
                        content: text,
                        timestamp: Utc::now(),
                        tool_calls: Vec::new(),
                        attachments: Vec::new(),
                    });
                }
            } else if let Some(text) = extract_text(&value, "assistant") {
                messages.push(Message {
                    role: Role::Assistant,
                    content: text,
                    timestamp: Utc::now(),
                    tool_calls: Vec::new(),
                    attachments: Vec::new(),
                });
            }
        }
        Ok(messages)
    }
}

fn find_title(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        if let Some(text) = extract_text(&value, "user") {
            if !is_interrupted_marker(&text) {
                return Some(truncate_title(&text));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_session(dir: &Path, id: &str, lines: &[&str]) {
        let path = dir.join(format!("{id}.jsonl"));
        let mut file = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    #[tokio::test]
    async fn round_trips_a_synthetic_session() {
        let home = TempDir::new().unwrap();
        std::env::set_var("HOME", home.path());
        let store = DialectAStore::new("stream-agent");

        let cwd = PathBuf::from("/work/project");
        let encoded = DialectAStore::encode_cwd(&cwd);
        let project_dir = home
            .path()
            .join(".stream-agent")
            .join("projects")
            .join(encoded);
        std::fs::create_dir_all(&project_dir).unwrap();

        write_session(
            &project_dir,
            "sess-1",
            &[
                r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"hello there"}]}}"#,
                r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hi back"}]}}"#,
            ],
        );

        let sessions = store.list_sessions(&cwd).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "sess-1");
        assert_eq!(sessions[0].title.as_deref(), Some("hello there"));

        let messages = store.load_session_messages("sess-1", &cwd).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello there");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "hi back");
    }

    #[tokio::test]
    async fn title_skips_interrupted_markers() {
        let home = TempDir::new().unwrap();
        std::env::set_var("HOME", home.path());
        let store = DialectAStore::new("stream-agent");
        let cwd = PathBuf::from("/work/proj2");
        let project_dir = home
            .path()
            .join(".stream-agent")
            .join("projects")
            .join(DialectAStore::encode_cwd(&cwd));
        std::fs::create_dir_all(&project_dir).unwrap();

        write_session(
            &project_dir,
            "sess-2",
            &[
                r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"[Request interrupted by user]"}]}}"#,
                r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"real first message"}]}}"#,
            ],
        );

        let sessions = store.list_sessions(&cwd).await.unwrap();
        assert_eq!(sessions[0].title.as_deref(), Some("real first message"));
    }
}
