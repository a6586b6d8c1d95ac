//! Bridge variant C6: a long-lived agent child speaking newline-delimited
//! JSON ("stream-json") on stdin/stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, instrument, warn};

use crate::error::{BridgeError, Result};
use crate::events::{Event, EventBus, EventKind, ToolStatus};
use crate::line_reader::LineReader;
use crate::types::{
    Attachment, BridgeState, Message, Provider, ProviderCapabilities, Response,
    SessionCapabilities, SessionInfo, Stats, ToolCallRecord, ToolPolicy, TokenUsage,
};

use super::base::{BridgeConfig, BridgeCore};
use super::{Bridge, TextStream};

type ChildStdout = tokio::process::ChildStdout;

struct RunningChild {
    child: Child,
    stdin: tokio::process::ChildStdin,
    reader: AsyncMutex<LineReader<ChildStdout>>,
}

pub struct StreamJsonBridge {
    core: BridgeCore,
    running: AsyncMutex<Option<RunningChild>>,
    stdin_lock: AsyncMutex<()>,
    read_lock: AsyncMutex<()>,
    tool_policy: std::sync::RwLock<ToolPolicy>,
}

impl StreamJsonBridge {
    pub fn new(config: BridgeConfig, bus: Arc<EventBus>) -> Result<Self> {
        let tool_policy = config.tool_policy.clone();
        Ok(Self {
            core: BridgeCore::new(Provider::StreamJson, config, bus)?,
            running: AsyncMutex::new(None),
            stdin_lock: AsyncMutex::new(()),
            read_lock: AsyncMutex::new(()),
            tool_policy: std::sync::RwLock::new(tool_policy),
        })
    }

    fn build_args(&self) -> Vec<String> {
        let cfg = &self.core.config;
        let mut args = vec![
            "-p".to_string(),
            "--input-format".into(),
            "stream-json".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--include-partial-messages".into(),
            "--settings".into(),
            self.core.sandbox.path().to_string_lossy().into_owned(),
            "--permission-mode".into(),
            cfg.permission_mode.clone(),
        ];
        if !cfg.mcp_servers.is_empty() {
            if let Ok(path) = self.core.sandbox.mcp_servers_config(&cfg.mcp_servers) {
                args.push("--mcp-config".into());
                args.push(path.to_string_lossy().into_owned());
            }
        }
        if let Some(system_prompt) = &cfg.system_prompt {
            args.push("--append-system-prompt".into());
            args.push(system_prompt.clone());
        }
        if let Some(max_turns) = cfg.max_turns {
            args.push("--max-turns".into());
            args.push(max_turns.to_string());
        }
        if let Some(resume) = &cfg.resume_session_id {
            args.push("--resume".into());
            args.push(resume.clone());
        } else if cfg.continue_last {
            args.push("--continue".into());
        }
        if let Some(schema) = &cfg.json_schema {
            args.push("--json-schema".into());
            args.push(schema.to_string_lossy().into_owned());
        }
        if let Some(fallback) = &cfg.fallback_model {
            args.push("--fallback-model".into());
            args.push(fallback.clone());
        }
        args
    }

    async fn write_frame(&self, stdin: &mut tokio::process::ChildStdin, frame: &serde_json::Value) -> Result<()> {
        let _guard = self.stdin_lock.lock().await;
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn build_content_blocks(prompt: &str, attachments: &[Attachment]) -> Vec<serde_json::Value> {
        let mut blocks = Vec::new();
        for attachment in attachments {
            match attachment.mime_family() {
                "image" => {
                    if let Ok(data) = std::fs::read(&attachment.path) {
                        blocks.push(serde_json::json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": attachment.mime_type,
                                "data": base64::engine::general_purpose::STANDARD.encode(data),
                            }
                        }));
                    }
                }
                _ if attachment.mime_type == "application/pdf" => {
                    if let Ok(data) = std::fs::read(&attachment.path) {
                        blocks.push(serde_json::json!({
                            "type": "document",
                            "source": {
                                "type": "base64",
                                "media_type": "application/pdf",
                                "data": base64::engine::general_purpose::STANDARD.encode(data),
                            },
                            "title": attachment.filename,
                        }));
                    }
                }
                _ => {}
            }
        }
        blocks.push(serde_json::json!({ "type": "text", "text": prompt }));
        blocks
    }

    /// Scans both the documented nested shape (`assistant.content[].type ==
    /// "tool_use"/"tool_result"`) and a bare top-level `tool_use`/`tool_result`
    /// frame, treating the latter as an alias for forward compatibility.
    fn extract_tool_events(frame: &serde_json::Value) -> Vec<EventKind> {
        let mut out = Vec::new();
        if let Some(content) = frame
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        {
            for block in content {
                if let Some(kind) = Self::tool_block_to_event(block) {
                    out.push(kind);
                }
            }
        }
        if let Some(kind) = Self::tool_block_to_event(frame) {
            out.push(kind);
        }
        out
    }

    fn tool_block_to_event(block: &serde_json::Value) -> Option<EventKind> {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("tool_use") => Some(EventKind::Tool {
                tool_name: block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                tool_id: block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                parameters: block.get("input").cloned().unwrap_or(serde_json::Value::Null),
                status: ToolStatus::Started,
                result: None,
                error: None,
            }),
            Some("tool_result") => Some(EventKind::Tool {
                tool_name: String::new(),
                tool_id: block
                    .get("tool_use_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                parameters: serde_json::Value::Null,
                status: if block.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false) {
                    ToolStatus::Failed
                } else {
                    ToolStatus::Completed
                },
                result: block.get("content").and_then(|v| v.as_str()).map(str::to_string),
                error: block
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .filter(|e| *e)
                    .and_then(|_| block.get("content").and_then(|v| v.as_str()))
                    .map(str::to_string),
            }),
            _ => None,
        }
    }

    fn extract_text_delta(frame: &serde_json::Value) -> Option<String> {
        frame
            .get("event")
            .and_then(|e| e.get("delta"))
            .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
            .and_then(|d| d.get("text"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
    }

    fn extract_full_text(frame: &serde_json::Value) -> Option<String> {
        let msg = frame.get("message")?;
        if msg.get("role").and_then(|r| r.as_str()) != Some("assistant") {
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
        (!text.is_empty()).then_some(text)
    }

    async fn run_turn(
        &self,
        prompt: &str,
        attachments: &[Attachment],
        mut on_text_delta: impl FnMut(&str),
    ) -> Result<Response> {
        if self.core.is_over_budget() {
            return Err(BridgeError::BudgetExceeded(format!(
                "${:.4} limit reached",
                self.core.config.max_budget_usd.unwrap_or_default()
            )));
        }
        if self.core.state() == BridgeState::Busy {
            return Err(BridgeError::Session("bridge is already processing a turn".into()));
        }
        self.core.set_state(BridgeState::Busy);
        let started = Instant::now();

        let result = self.run_turn_inner(prompt, attachments, &mut on_text_delta).await;

        self.core.set_state(match &result {
            Ok(_) => BridgeState::Ready,
            Err(_) => BridgeState::Error,
        });

        let duration = started.elapsed();
        match &result {
            Ok(response) => {
                self.core
                    .record_result(response.success, duration, response.cost_usd, 0, 0);
            }
            Err(_) => self.core.record_result(false, duration, None, 0, 0),
        }
        result
    }

    async fn run_turn_inner(
        &self,
        prompt: &str,
        attachments: &[Attachment],
        on_text_delta: &mut impl FnMut(&str),
    ) -> Result<Response> {
        let _read_guard = self.read_lock.lock().await;
        // Unlike the ACP variant, the system prompt reaches the agent as a
        // native `--append-system-prompt` flag in `build_args()`, so no
        // per-turn text-prefix injection is needed here.
        let blocks = Self::build_content_blocks(prompt, attachments);
        let frame = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": blocks },
        });

        let mut running = self.running.lock().await;
        let running = running
            .as_mut()
            .ok_or_else(|| BridgeError::Connection("bridge is not started".into()))?;

        self.write_frame(&mut running.stdin, &frame).await?;
        self.core.push_history(Message::user(prompt));

        let mut text = String::new();
        let mut raw_events = Vec::new();
        let mut tool_calls = Vec::new();
        let mut cost_usd = None;
        let mut session_id = None;

        loop {
            let line = tokio::time::timeout(self.core.config.timeout, async {
                running.reader.lock().await.read_line().await
            })
            .await
            .map_err(|_| BridgeError::Timeout(format!("{}s", self.core.config.timeout.as_secs())))??;

            let Some(line) = line else {
                return Err(BridgeError::Connection("agent process closed stdout".into()));
            };
            if line.trim().is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                tracing::debug!(%line, "discarding non-JSON stream-json line");
                continue;
            };
            raw_events.push(value.clone());

            if let Some(sid) = value.get("session_id").and_then(|v| v.as_str()) {
                session_id = Some(sid.to_string());
            }

            if let Some(delta) = Self::extract_text_delta(&value) {
                text.push_str(&delta);
                on_text_delta(&delta);
                self.core.fire_output(&delta);
                self.core.bus.emit(Event::new(
                    self.core.provider,
                    EventKind::Text { text: delta, is_complete: false },
                ));
            } else if let Some(full) = Self::extract_full_text(&value) {
                if text.is_empty() {
                    text = full;
                }
            }

            for kind in Self::extract_tool_events(&value) {
                if let EventKind::Tool { ref tool_name, ref tool_id, status, .. } = kind {
                    if status == ToolStatus::Started && !self.tool_policy.read().unwrap().is_permitted(tool_name) {
                        self.core.bus.emit(Event::new(
                            self.core.provider,
                            EventKind::Tool {
                                tool_name: tool_name.clone(),
                                tool_id: tool_id.clone(),
                                parameters: serde_json::Value::Null,
                                status: ToolStatus::Failed,
                                result: None,
                                error: Some("denied by policy".into()),
                            },
                        ));
                        continue;
                    }
                    tool_calls.push(ToolCallRecord {
                        tool_id: tool_id.clone(),
                        tool_name: tool_name.clone(),
                        parameters: serde_json::Value::Null,
                        result: None,
                        error: None,
                    });
                }
                self.core.bus.emit(Event::new(self.core.provider, kind));
            }

            if value.get("type").and_then(|t| t.as_str()) == Some("result") {
                cost_usd = value.get("total_cost_usd").and_then(|v| v.as_f64());
                if text.is_empty() {
                    if let Some(fallback) = value.get("result").and_then(|v| v.as_str()) {
                        text = fallback.to_string();
                    }
                }
                break;
            }
        }

        self.core.bus.emit(Event::new(
            self.core.provider,
            EventKind::Text { text: String::new(), is_complete: true },
        ));

        if let Some(cost) = cost_usd {
            self.core.bus.emit(Event::new(
                self.core.provider,
                EventKind::Cost { cost_usd: cost, input_tokens: 0, output_tokens: 0 },
            ));
        }

        self.core.push_history(Message::assistant(text.clone()));
        if let Some(sid) = &session_id {
            self.core.set_session_id(Some(sid.clone()));
        }

        Ok(Response {
            content: text,
            success: true,
            error: None,
            tool_calls,
            raw_events,
            duration_ms: 0,
            session_id,
            cost_usd,
            token_usage: Some(TokenUsage::default()),
            generated_images: Vec::new(),
        })
    }
}

#[async_trait]
impl Bridge for StreamJsonBridge {
    #[instrument(skip(self), fields(provider = "stream-json"))]
    async fn start(&self) -> Result<()> {
        self.core.set_state(BridgeState::WarmingUp);
        let args = self.build_args();

        let mut command = Command::new(&self.core.config.executable);
        command
            .args(&args)
            .current_dir(&self.core.config.working_dir)
            .envs(&self.core.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| BridgeError::Connection(format!("failed to spawn {}: {e}", self.core.config.executable)))?;

        // Give the child a moment to fail fast (missing binary, bad flags)
        // before declaring readiness.
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(status) = child.try_wait()? {
            let mut stderr_text = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut stderr_text).await;
            }
            self.core.set_state(BridgeState::Error);
            return Err(BridgeError::Connection(format!(
                "agent exited immediately with {status}: {stderr_text}"
            )));
        }

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::Connection("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Connection("no stdout".into()))?;
        let stderr = child.stderr.take();

        if let Some(stderr) = stderr {
            let core_provider = self.core.provider;
            let bus = self.core.bus.clone();
            tokio::spawn(async move {
                let mut reader = LineReader::new(stderr);
                while let Ok(Some(line)) = reader.read_line().await {
                    bus.emit(Event::new(
                        core_provider,
                        EventKind::Diagnostic {
                            message: super::base::strip_ansi(&line),
                            level: super::base::classify_stderr_level(&line),
                            source: "stderr".into(),
                        },
                    ));
                }
            });
        }

        *self.running.lock().await = Some(RunningChild {
            child,
            stdin,
            reader: AsyncMutex::new(LineReader::new(stdout)),
        });

        self.core.set_state(BridgeState::Ready);
        info!(executable = %self.core.config.executable, "stream-json bridge ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(mut running) = running.take() {
            drop(running.stdin);
            match tokio::time::timeout(Duration::from_secs(5), running.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("stream-json agent did not exit in time, killing");
                    let _ = running.child.kill().await;
                }
            }
        }
        self.core.set_state(BridgeState::Disconnected);
        self.core.sandbox.cleanup().await?;
        Ok(())
    }

    async fn send(&self, prompt: &str, attachments: &[Attachment]) -> Result<Response> {
        self.run_turn(prompt, attachments, |_| {}).await
    }

    async fn send_stream(self: Arc<Self>, prompt: &str) -> Result<TextStream> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            let tx2 = tx.clone();
            let result = self
                .run_turn(&prompt, &[], move |delta| {
                    let _ = tx2.send(delta.to_string());
                })
                .await;
            if let Err(e) = result {
                let _ = tx.send(format!("[error: {e}]"));
            }
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        Ok(Vec::new())
    }

    async fn resume_session(&self, session_id: &str) -> Result<()> {
        self.stop().await?;
        // A fresh bridge would normally be constructed with
        // `resume_session_id` set; here we just re-point the existing
        // config and restart, mirroring `--resume` semantics.
        self.core.set_session_id(Some(session_id.to_string()));
        self.start().await
    }

    fn state(&self) -> BridgeState {
        self.core.state()
    }

    fn session_id(&self) -> Option<String> {
        self.core.session_id()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        Provider::StreamJson.capabilities()
    }

    fn session_capabilities(&self) -> SessionCapabilities {
        SessionCapabilities {
            can_list: false,
            can_load: true,
            can_continue_last: true,
        }
    }

    fn history(&self) -> Vec<Message> {
        self.core.history()
    }

    fn clear_history(&self) {
        self.core.clear_history()
    }

    fn stats(&self) -> Stats {
        self.core.stats()
    }

    fn reset_stats(&self) {
        self.core.reset_stats()
    }

    fn tool_policy(&self) -> ToolPolicy {
        self.tool_policy.read().unwrap().clone()
    }

    fn set_tool_policy(&self, policy: ToolPolicy) {
        *self.tool_policy.write().unwrap() = policy;
    }

    fn is_healthy(&self) -> bool {
        self.core.state() != BridgeState::Error
    }

    fn total_cost(&self) -> f64 {
        self.core.total_cost()
    }

    fn is_over_budget(&self) -> bool {
        self.core.is_over_budget()
    }
}
