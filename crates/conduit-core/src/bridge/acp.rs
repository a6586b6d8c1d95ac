//! Bridge variant C7: a long-lived agent child speaking the Agent Client
//! Protocol (JSON-RPC over stdio) via the `agent-client-protocol` SDK.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use agent_client_protocol::{
    Agent, Client, ClientCapabilities, ClientSideConnection, ContentBlock, CreateTerminalRequest,
    CreateTerminalResponse, Error as AcpSdkError, ExtNotification, ExtRequest, ExtResponse,
    FileSystemCapability, InitializeRequest, KillTerminalCommandRequest,
    KillTerminalCommandResponse, LoadSessionRequest, McpServer, McpServerStdio, NewSessionRequest,
    PermissionOptionKind, PromptRequest, ReadTextFileRequest, ReadTextFileResponse,
    ReleaseTerminalRequest, ReleaseTerminalResponse, RequestPermissionOutcome,
    RequestPermissionRequest, RequestPermissionResponse, Result as AcpSdkResult,
    SelectedPermissionOutcome, SessionNotification, SessionUpdate, TerminalOutputRequest,
    TerminalOutputResponse, WaitForTerminalExitRequest, WaitForTerminalExitResponse,
    WriteTextFileRequest, WriteTextFileResponse,
};
use async_trait::async_trait;
use base64::Engine as _;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::{info, instrument, warn};

use crate::error::{BridgeError, Result};
use crate::events::{Event, EventBus, EventKind, ThinkingPhase, ToolStatus};
use crate::session_store::{DialectBStore, DialectCStore, SessionStore};
use crate::thinking::ThinkingBlockCache;
use crate::types::{
    Attachment, BridgeState, Message, Provider, ProviderCapabilities, Response,
    SessionCapabilities, SessionInfo, Stats, ToolCallRecord, ToolPolicy, TokenUsage,
};

use super::base::{BridgeConfig, BridgeCore};
use super::{Bridge, TextStream};

/// Implements the ACP `Client` trait: the callbacks an agent invokes on us.
/// Permission requests auto-approve the first `allow`-flavoured option;
/// session notifications are forwarded to the owning bridge over a channel
/// so the streaming-vs-buffered accumulation logic stays in one place.
struct EngineClient {
    provider: Provider,
    bus: Arc<EventBus>,
    tool_policy: Arc<StdMutex<ToolPolicy>>,
    notification_tx: tokio::sync::mpsc::UnboundedSender<SessionNotification>,
}

#[async_trait(?Send)]
impl Client for EngineClient {
    async fn request_permission(
        &self,
        request: RequestPermissionRequest,
    ) -> AcpSdkResult<RequestPermissionResponse> {
        self.bus.emit(Event::new(
            self.provider,
            EventKind::PermissionRequest {
                request_id: format!("{:?}", request.tool_call.tool_call_id),
                tool_name: request.tool_call.fields.title.clone().unwrap_or_default(),
                tool_input: serde_json::Value::Null,
                options: request.options.iter().map(|o| o.option_id.to_string()).collect(),
            },
        ));
        let tool_name = request.tool_call.fields.title.clone().unwrap_or_default();
        let permitted = self.tool_policy.lock().unwrap().is_permitted(&tool_name);
        let outcome = if permitted {
            match request
                .options
                .iter()
                .find(|o| matches!(o.kind, PermissionOptionKind::AllowOnce))
            {
                Some(option) => {
                    RequestPermissionOutcome::Selected(SelectedPermissionOutcome::new(option.option_id.clone()))
                }
                None => RequestPermissionOutcome::Cancelled,
            }
        } else {
            RequestPermissionOutcome::Cancelled
        };
        Ok(RequestPermissionResponse::new(outcome))
    }

    async fn session_notification(&self, notification: SessionNotification) -> AcpSdkResult<()> {
        let _ = self.notification_tx.send(notification);
        Ok(())
    }

    async fn read_text_file(&self, request: ReadTextFileRequest) -> AcpSdkResult<ReadTextFileResponse> {
        let content = tokio::fs::read_to_string(&request.path)
            .await
            .map_err(|e| AcpSdkError::internal_error().data(e.to_string()))?;
        Ok(ReadTextFileResponse::new(content))
    }

    async fn write_text_file(&self, request: WriteTextFileRequest) -> AcpSdkResult<WriteTextFileResponse> {
        tokio::fs::write(&request.path, &request.content)
            .await
            .map_err(|e| AcpSdkError::internal_error().data(e.to_string()))?;
        Ok(WriteTextFileResponse::new())
    }

    async fn create_terminal(&self, _request: CreateTerminalRequest) -> AcpSdkResult<CreateTerminalResponse> {
        Err(AcpSdkError::method_not_found())
    }
    async fn terminal_output(&self, _request: TerminalOutputRequest) -> AcpSdkResult<TerminalOutputResponse> {
        Err(AcpSdkError::method_not_found())
    }
    async fn release_terminal(&self, _request: ReleaseTerminalRequest) -> AcpSdkResult<ReleaseTerminalResponse> {
        Err(AcpSdkError::method_not_found())
    }
    async fn wait_for_terminal_exit(
        &self,
        _request: WaitForTerminalExitRequest,
    ) -> AcpSdkResult<WaitForTerminalExitResponse> {
        Err(AcpSdkError::method_not_found())
    }
    async fn kill_terminal_command(
        &self,
        _request: KillTerminalCommandRequest,
    ) -> AcpSdkResult<KillTerminalCommandResponse> {
        Err(AcpSdkError::method_not_found())
    }
    async fn ext_method(&self, _request: ExtRequest) -> AcpSdkResult<ExtResponse> {
        Err(AcpSdkError::method_not_found())
    }
    async fn ext_notification(&self, _notification: ExtNotification) -> AcpSdkResult<()> {
        Ok(())
    }
}

struct RunningAgent {
    child: Child,
    connection: ClientSideConnection,
    _io_task: tokio::task::JoinHandle<std::result::Result<(), AcpSdkError>>,
    notification_rx: AsyncMutex<tokio::sync::mpsc::UnboundedReceiver<SessionNotification>>,
}

pub struct AcpBridge {
    core: BridgeCore,
    agent_name: String,
    running: AsyncMutex<Option<RunningAgent>>,
    acp_session_id: StdMutex<Option<String>>,
    acp_mode: AtomicBool,
    tool_policy: Arc<StdMutex<ToolPolicy>>,
    session_caps: StdMutex<SessionCapabilities>,
    filesystem_store: Box<dyn SessionStore>,
}

impl AcpBridge {
    pub fn new(
        provider: Provider,
        agent_name: impl Into<String>,
        config: BridgeConfig,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let tool_policy = Arc::new(StdMutex::new(config.tool_policy.clone()));
        let agent_name = agent_name.into();
        let filesystem_store: Box<dyn SessionStore> = match provider {
            Provider::AcpA => Box::new(DialectBStore::new(agent_name.clone())),
            _ => Box::new(DialectCStore::new(agent_name.clone())),
        };
        Ok(Self {
            core: BridgeCore::new(provider, config, bus)?,
            agent_name,
            running: AsyncMutex::new(None),
            acp_session_id: StdMutex::new(None),
            acp_mode: AtomicBool::new(true),
            tool_policy,
            session_caps: StdMutex::new(SessionCapabilities::default()),
            filesystem_store,
        })
    }

    /// Builds the prompt's content blocks. Attachments past the provider's
    /// inline threshold become resource links instead of inline base64, per
    /// the same size rule the stream-json variant applies to uploads.
    ///
    /// Multimodal blocks are assembled as JSON and decoded into the SDK's
    /// `ContentBlock` rather than built via struct literals: the wire shape
    /// (MCP's content-block schema) is the stable contract here, not the
    /// SDK's exact Rust field names.
    fn build_prompt_blocks(&self, text: &str, attachments: &[Attachment]) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        for attachment in attachments {
            let value = if attachment.size_bytes > self.core.provider.inline_attachment_limit() {
                serde_json::json!({
                    "type": "resource_link",
                    "uri": format!("file://{}", attachment.path.display()),
                    "name": attachment.filename,
                    "mimeType": attachment.mime_type,
                    "size": attachment.size_bytes,
                })
            } else {
                let Ok(data) = std::fs::read(&attachment.path) else { continue };
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                match attachment.mime_family() {
                    "image" => serde_json::json!({"type": "image", "data": encoded, "mimeType": attachment.mime_type}),
                    "audio" => serde_json::json!({"type": "audio", "data": encoded, "mimeType": attachment.mime_type}),
                    _ => serde_json::json!({
                        "type": "resource",
                        "resource": {"uri": format!("file://{}", attachment.path.display()), "blob": encoded, "mimeType": attachment.mime_type},
                    }),
                }
            };
            match serde_json::from_value::<ContentBlock>(value) {
                Ok(block) => blocks.push(block),
                Err(e) => warn!(attachment = %attachment.filename, "skipping unrepresentable attachment: {e}"),
            }
        }
        blocks.push(ContentBlock::from(text.to_string()));
        blocks
    }

    fn prompt_timeout(&self, attachments: &[Attachment]) -> Duration {
        let mb: u64 = attachments.iter().map(|a| a.size_bytes).sum::<u64>() / (1024 * 1024);
        self.core.config.timeout + Duration::from_secs(mb * 3)
    }

    async fn establish_session(&self, connection: &ClientSideConnection) -> Result<String> {
        let cwd = self.core.config.working_dir.clone();
        let mcp_servers: Vec<McpServer> = self
            .core
            .config
            .mcp_servers
            .iter()
            .map(|(name, command, args)| {
                McpServer::Stdio(McpServerStdio::new(name.clone(), PathBuf::from(command)).args(args.clone()))
            })
            .collect();

        if let Some(resume_id) = &self.core.config.resume_session_id {
            if self.session_caps.lock().unwrap().can_load {
                let loaded = connection
                    .load_session(
                        LoadSessionRequest::new(resume_id.clone(), cwd.clone())
                            .mcp_servers(mcp_servers.clone()),
                    )
                    .await;
                if loaded.is_ok() {
                    return Ok(resume_id.clone());
                }
                warn!(session_id = %resume_id, "load_session failed, falling back to filesystem history + new session");
            }
        } else if self.core.config.continue_last && self.session_caps.lock().unwrap().can_load {
            if let Ok(mut sessions) = self.filesystem_store.list_sessions(&cwd).await {
                if let Some(latest) = sessions.drain(..).next() {
                    let loaded = connection
                        .load_session(
                            LoadSessionRequest::new(latest.session_id.clone(), cwd.clone())
                                .mcp_servers(mcp_servers.clone()),
                        )
                        .await;
                    if loaded.is_ok() {
                        return Ok(latest.session_id);
                    }
                    warn!(session_id = %latest.session_id, "continue_last load_session failed, falling back to new session");
                }
            }
        }

        let response = connection
            .new_session(NewSessionRequest::new(cwd).mcp_servers(mcp_servers))
            .await
            .map_err(|e| BridgeError::Session(format!("new_session failed: {e}")))?;
        Ok(response.session_id.to_string())
    }
}

impl AcpBridge {
    fn initialize_request() -> InitializeRequest {
        InitializeRequest::new(1u16.into()).client_capabilities(
            ClientCapabilities::new()
                .fs(FileSystemCapability::new().read_text_file(true).write_text_file(true))
                .terminal(true),
        )
    }
}

#[async_trait]
impl Bridge for AcpBridge {
    #[instrument(skip(self), fields(provider = %self.core.provider.name()))]
    async fn start(&self) -> Result<()> {
        self.core.set_state(BridgeState::WarmingUp);

        let mut command = Command::new(&self.core.config.executable);
        command
            .arg("--experimental-acp")
            .current_dir(&self.core.config.working_dir)
            .envs(&self.core.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| BridgeError::Connection(format!("failed to spawn {}: {e}", self.core.config.executable)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Connection("no stdin".into()))?
            .compat_write();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Connection("no stdout".into()))?
            .compat();
        if let Some(stderr) = child.stderr.take() {
            let core_provider = self.core.provider;
            let bus = self.core.bus.clone();
            tokio::spawn(async move {
                let mut reader = crate::line_reader::LineReader::new(stderr);
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

        let (notification_tx, notification_rx) = tokio::sync::mpsc::unbounded_channel();
        let client = EngineClient {
            provider: self.core.provider,
            bus: self.core.bus.clone(),
            tool_policy: self.tool_policy.clone(),
            notification_tx,
        };

        let (connection, io_fut) = ClientSideConnection::new(client, stdin, stdout, |_fut| {});
        // The connection's IO future (and the `Client` callbacks it drives)
        // are `!Send`: `ClientSideConnection` is built for single-threaded
        // use via `LocalSet`. `spawn_local` requires the caller to already
        // be running inside one, which is why the engine owning this bridge
        // must drive its bridges from a `LocalSet::run_until` task.
        let io_task = tokio::task::spawn_local(io_fut);

        let init_response = connection
            .initialize(Self::initialize_request())
            .await
            .map_err(|e| BridgeError::Connection(format!("initialize failed: {e}")))?;

        {
            let mut caps = self.session_caps.lock().unwrap();
            caps.can_list = true;
            // Loading is advertised only after session creation for AcpA,
            // which is known to hang on `load_session` before a session
            // exists; this matches the resolved open question in the
            // component design for this provider's filesystem fallback.
            caps.can_load = self.core.provider != Provider::AcpA;
            caps.can_continue_last = init_response.agent_capabilities.load_session;
        }

        let session_id = match self.establish_session(&connection).await {
            Ok(id) => id,
            Err(e) => {
                self.core.set_state(BridgeState::Error);
                if self.core.provider == Provider::AcpA {
                    self.acp_mode.store(false, Ordering::SeqCst);
                }
                return Err(e);
            }
        };
        self.acp_session_id.lock().unwrap().replace(session_id.clone());
        self.core.set_session_id(Some(session_id));

        if self.core.provider == Provider::AcpA {
            self.session_caps.lock().unwrap().can_load = true;
        }

        *self.running.lock().await = Some(RunningAgent {
            child,
            connection,
            _io_task: io_task,
            notification_rx: AsyncMutex::new(notification_rx),
        });

        self.core.set_state(BridgeState::Ready);
        info!(agent = %self.agent_name, "ACP bridge ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(mut running) = running.take() {
            drop(running.connection);
            match tokio::time::timeout(Duration::from_secs(5), running.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = running.child.kill().await;
                }
            }
        }
        self.core.set_state(BridgeState::Disconnected);
        self.core.sandbox.cleanup().await?;
        Ok(())
    }

    async fn send(&self, prompt: &str, attachments: &[Attachment]) -> Result<Response> {
        if self.core.state() == BridgeState::Busy {
            return Err(BridgeError::Session("bridge is already processing a turn".into()));
        }
        if !self.acp_mode.load(Ordering::SeqCst) {
            return self.send_oneshot_fallback(prompt, attachments).await;
        }

        self.core.set_state(BridgeState::Busy);
        let started = Instant::now();
        let result = self.send_acp(prompt, attachments).await;
        self.core.set_state(match &result {
            Ok(_) => BridgeState::Ready,
            Err(_) => BridgeState::Error,
        });
        let duration = started.elapsed();
        match &result {
            Ok(response) => self.core.record_result(response.success, duration, response.cost_usd, 0, 0),
            Err(_) => self.core.record_result(false, duration, None, 0, 0),
        }
        result
    }

    async fn send_stream(self: Arc<Self>, prompt: &str) -> Result<TextStream> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            match self.send(&prompt, &[]).await {
                Ok(response) => {
                    let _ = tx.send(response.content);
                }
                Err(e) => {
                    let _ = tx.send(format!("[error: {e}]"));
                }
            }
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.filesystem_store
            .list_sessions(&self.core.config.working_dir)
            .await
    }

    async fn resume_session(&self, session_id: &str) -> Result<()> {
        let history = self
            .filesystem_store
            .load_session_messages(session_id, &self.core.config.working_dir)
            .await?;
        self.stop().await?;
        self.acp_session_id.lock().unwrap().replace(session_id.to_string());
        self.start().await?;
        for message in history {
            self.core.push_history(message);
        }
        Ok(())
    }

    fn state(&self) -> BridgeState {
        self.core.state()
    }

    fn session_id(&self) -> Option<String> {
        self.core.session_id()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.core.provider.capabilities()
    }

    fn session_capabilities(&self) -> SessionCapabilities {
        *self.session_caps.lock().unwrap()
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
        self.tool_policy.lock().unwrap().clone()
    }

    fn set_tool_policy(&self, policy: ToolPolicy) {
        *self.tool_policy.lock().unwrap() = policy;
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

impl AcpBridge {
    async fn send_acp(&self, prompt: &str, attachments: &[Attachment]) -> Result<Response> {
        let injected = self.core.maybe_inject_system_prompt(prompt);
        let blocks = self.build_prompt_blocks(&injected, attachments);
        let timeout = self.prompt_timeout(attachments);

        let running = self.running.lock().await;
        let running = running
            .as_ref()
            .ok_or_else(|| BridgeError::Connection("bridge is not started".into()))?;
        let session_id = self
            .acp_session_id
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BridgeError::Session("no active session".into()))?;

        self.core.push_history(Message::user(prompt));

        let mut text_buffer = String::new();
        let mut was_thinking = false;
        let mut thinking_cache = ThinkingBlockCache::new();
        let mut tool_calls = Vec::new();

        let prompt_fut = running
            .connection
            .prompt(PromptRequest::new(session_id.clone(), blocks));
        tokio::pin!(prompt_fut);

        let mut notification_rx = running.notification_rx.lock().await;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let prompt_result = loop {
            tokio::select! {
                result = &mut prompt_fut => break result,
                Some(notification) = notification_rx.recv() => {
                    self.handle_notification(
                        notification,
                        &mut text_buffer,
                        &mut was_thinking,
                        &mut thinking_cache,
                        &mut tool_calls,
                    );
                }
                _ = &mut deadline => {
                    return Err(BridgeError::Timeout(format!("{}s", timeout.as_secs())));
                }
            }
        };

        match prompt_result {
            Ok(_) => {
                self.core.push_history(Message::assistant(text_buffer.clone()));
                Ok(Response {
                    content: text_buffer,
                    success: true,
                    error: None,
                    tool_calls,
                    raw_events: Vec::new(),
                    duration_ms: 0,
                    session_id: Some(session_id),
                    cost_usd: None,
                    token_usage: Some(TokenUsage::default()),
                    generated_images: Vec::new(),
                })
            }
            Err(e) if self.looks_like_catastrophic_size_error(&e, attachments) => Err(BridgeError::Session(format!(
                "file too large for inline upload ({} MB); session will be recreated",
                attachments.iter().map(|a| a.size_bytes).sum::<u64>() / (1024 * 1024)
            ))),
            Err(e) => Ok(Response::failure(format!("prompt failed: {e}"))),
        }
    }

    fn handle_notification(
        &self,
        notification: SessionNotification,
        text_buffer: &mut String,
        was_thinking: &mut bool,
        thinking_cache: &mut ThinkingBlockCache,
        tool_calls: &mut Vec<ToolCallRecord>,
    ) {
        match notification.update {
            SessionUpdate::AgentThoughtChunk(chunk) => {
                let thought = content_block_text(&chunk.content);
                let block_id = "current-thought".to_string();
                let (subject, phase) = thinking_cache.classify(&block_id, &thought);
                *was_thinking = true;
                self.core.bus.emit(Event::new(
                    self.core.provider,
                    EventKind::Thinking {
                        thought,
                        phase,
                        subject,
                        is_start: false,
                        is_complete: false,
                        block_id,
                        token_count: None,
                    },
                ));
            }
            SessionUpdate::AgentMessageChunk(chunk) => {
                if *was_thinking {
                    *was_thinking = false;
                    self.core.bus.emit(Event::new(
                        self.core.provider,
                        EventKind::Thinking {
                            thought: String::new(),
                            phase: ThinkingPhase::General,
                            subject: String::new(),
                            is_start: false,
                            is_complete: true,
                            block_id: "current-thought".into(),
                            token_count: None,
                        },
                    ));
                }
                let text = content_block_text(&chunk.content);
                text_buffer.push_str(&text);
                self.core.fire_output(&text);
                self.core
                    .bus
                    .emit(Event::new(self.core.provider, EventKind::Text { text, is_complete: false }));
            }
            SessionUpdate::ToolCall(call) => {
                let permitted = self.tool_policy.lock().unwrap().is_permitted(&call.title);
                let status = if permitted { ToolStatus::Started } else { ToolStatus::Failed };
                let raw_input = call.raw_input.clone().unwrap_or(serde_json::Value::Null);
                if permitted {
                    tool_calls.push(ToolCallRecord {
                        tool_id: call.tool_call_id.to_string(),
                        tool_name: call.title.clone(),
                        parameters: raw_input.clone(),
                        result: None,
                        error: None,
                    });
                }
                self.core.bus.emit(Event::new(
                    self.core.provider,
                    EventKind::Tool {
                        tool_name: call.title,
                        tool_id: call.tool_call_id.to_string(),
                        parameters: raw_input,
                        status,
                        result: None,
                        error: if permitted { None } else { Some("denied by policy".into()) },
                    },
                ));
            }
            SessionUpdate::ToolCallUpdate(update) => {
                self.core.bus.emit(Event::new(
                    self.core.provider,
                    EventKind::Tool {
                        tool_name: update.fields.title.clone().unwrap_or_default(),
                        tool_id: update.tool_call_id.to_string(),
                        parameters: update.fields.raw_input.clone().unwrap_or(serde_json::Value::Null),
                        status: ToolStatus::Completed,
                        result: None,
                        error: None,
                    },
                ));
            }
            _ => {
                // Unknown/forward-compatible variant: attempt a best-effort
                // text extraction only; never misclassify it as thinking.
            }
        }
    }

    fn looks_like_catastrophic_size_error(&self, error: &AcpSdkError, attachments: &[Attachment]) -> bool {
        !attachments.is_empty() && format!("{error}").to_lowercase().contains("internal")
    }

    /// Oneshot fallback for providers where ACP initialization failed: one
    /// child per request, no persistent session, prior turns folded into
    /// the prompt as plain-text context.
    async fn send_oneshot_fallback(&self, prompt: &str, _attachments: &[Attachment]) -> Result<Response> {
        let history_context: String = self
            .core
            .history()
            .iter()
            .map(|m| format!("{:?}: {}\n", m.role, m.content))
            .collect();
        let full_prompt = if history_context.is_empty() {
            prompt.to_string()
        } else {
            format!("[Previous conversation:]\n{history_context}\n{prompt}")
        };

        let output = tokio::process::Command::new(&self.core.config.executable)
            .args(["--output-format", "stream-json", "-p", &full_prompt])
            .current_dir(&self.core.config.working_dir)
            .envs(&self.core.config.env)
            .output()
            .await
            .map_err(|e| BridgeError::Connection(format!("oneshot spawn failed: {e}")))?;

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        self.core.push_history(Message::user(prompt));
        self.core.push_history(Message::assistant(text.clone()));
        Ok(Response {
            content: text,
            success: output.status.success(),
            error: (!output.status.success()).then(|| String::from_utf8_lossy(&output.stderr).into_owned()),
            tool_calls: Vec::new(),
            raw_events: Vec::new(),
            duration_ms: 0,
            session_id: None,
            cost_usd: None,
            token_usage: None,
            generated_images: Vec::new(),
        })
    }
}

fn content_block_text(block: &ContentBlock) -> String {
    match block {
        ContentBlock::Text(text_block) => text_block.text.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_timeout_scales_with_attachment_size() {
        let bus = Arc::new(EventBus::new());
        let bridge = AcpBridge::new(Provider::AcpA, "acp-a-agent", BridgeConfig::default(), bus).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![0u8; 5 * 1024 * 1024]).unwrap();
        let attachment = Attachment::from_path(&path, "application/octet-stream").unwrap();

        let base = bridge.core.config.timeout;
        let scaled = bridge.prompt_timeout(std::slice::from_ref(&attachment));
        assert_eq!(scaled, base + Duration::from_secs(15));
    }
}
