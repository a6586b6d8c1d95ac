//! Engine (C9): owns a single bridge instance and the typed Event Bus,
//! applies pre-turn gates, drives bounded auto-restart, and exposes the
//! provider-agnostic conversation API applications actually call.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::activity::ActivityTracker;
use crate::bridge::{AcpBridge, Bridge, BridgeConfig, StreamJsonBridge, TextStream};
use crate::error::Result;
use crate::events::{Event, EventBus, EventKind, ToolStatus};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::types::{
    Attachment, BridgeState, EngineState, Message, Provider, ProviderCapabilities, Response,
    SessionCapabilities, SessionInfo, Stats, ToolPolicy,
};

/// Everything needed to build an engine and the bridge it starts with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider: Provider,
    pub agent_name: String,
    pub bridge: BridgeConfig,
    pub rate_limit: RateLimitConfig,
    pub max_restarts: u32,
    pub health_check_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: Provider::StreamJson,
            agent_name: "stream-json-agent".to_string(),
            bridge: BridgeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            max_restarts: 3,
            health_check_interval: Some(Duration::from_secs(30)),
        }
    }
}

fn build_bridge(
    provider: Provider,
    agent_name: &str,
    config: BridgeConfig,
    bus: Arc<EventBus>,
) -> Result<Arc<dyn Bridge>> {
    match provider {
        Provider::StreamJson => Ok(Arc::new(StreamJsonBridge::new(config, bus)?)),
        Provider::AcpA | Provider::AcpB => {
            Ok(Arc::new(AcpBridge::new(provider, agent_name.to_string(), config, bus)?))
        }
    }
}

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;
type LocalJob = Box<dyn FnOnce() -> LocalFuture + Send>;

/// A single dedicated OS thread running a current-thread runtime plus a
/// `LocalSet`. ACP bridges call `tokio::task::spawn_local` while starting up
/// (the SDK's connection IO future is `!Send`; see `acp_client.rs`'s
/// `spawn_agent` doc comment: "caller must spawn with LocalSet"), so the
/// portion of `start()` that builds the connection has to run somewhere a
/// `LocalSet` is active. Every other bridge call stays on the caller's own
/// task — `ClientSideConnection`'s request handle is an ordinary `Send`
/// channel front-end.
struct LocalDriver {
    tx: tokio::sync::mpsc::UnboundedSender<LocalJob>,
    _thread: thread::JoinHandle<()>,
}

impl LocalDriver {
    fn spawn() -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<LocalJob>();
        let thread = thread::Builder::new()
            .name("conduit-acp-local".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build local ACP driver runtime");
                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    while let Some(job) = rx.recv().await {
                        tokio::task::spawn_local(job());
                    }
                });
            })
            .expect("failed to spawn local ACP driver thread");
        Self { tx, _thread: thread }
    }

    async fn run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let job: LocalJob = Box::new(move || {
            Box::pin(async move {
                let result = f().await;
                let _ = reply_tx.send(result);
            }) as LocalFuture
        });
        self.tx
            .send(job)
            .map_err(|_| ())
            .expect("local ACP driver thread is gone");
        reply_rx.await.expect("local ACP driver dropped its reply")
    }
}

struct ActiveBridge {
    provider: Provider,
    agent_name: String,
    bridge: Arc<dyn Bridge>,
}

/// Owns one bridge, the typed event bus it publishes onto, the rate limiter
/// and activity tracker shared by every turn, and the restart/shutdown state
/// machine described for this layer.
pub struct Engine {
    active: StdMutex<ActiveBridge>,
    bus: Arc<EventBus>,
    activity: Arc<ActivityTracker>,
    rate_limiter: RateLimiter,
    local_driver: StdMutex<Option<Arc<LocalDriver>>>,
    config: StdMutex<EngineConfig>,
    restart_count: AtomicU32,
    shutting_down: Arc<AtomicBool>,
    signal_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    health_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let bus = Arc::new(EventBus::new());
        let bridge = build_bridge(config.provider, &config.agent_name, config.bridge.clone(), bus.clone())?;
        let activity = Arc::new(ActivityTracker::new(config.provider));

        install_activity_bridge(bus.clone(), activity.clone());

        Ok(Arc::new(Self {
            active: StdMutex::new(ActiveBridge {
                provider: config.provider,
                agent_name: config.agent_name.clone(),
                bridge,
            }),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            local_driver: StdMutex::new(None),
            bus,
            activity,
            signal_task: StdMutex::new(None),
            health_task: StdMutex::new(None),
            restart_count: AtomicU32::new(0),
            shutting_down: Arc::new(AtomicBool::new(false)),
            config: StdMutex::new(config),
        }))
    }

    fn current(&self) -> (Provider, Arc<dyn Bridge>) {
        let active = self.active.lock().unwrap();
        (active.provider, active.bridge.clone())
    }

    fn local_driver(&self) -> Arc<LocalDriver> {
        let mut guard = self.local_driver.lock().unwrap();
        guard.get_or_insert_with(|| Arc::new(LocalDriver::spawn())).clone()
    }

    /// Runs `bridge.start()`, routing through the dedicated `LocalSet` thread
    /// for ACP providers and running inline for everything else.
    async fn start_on(&self, provider: Provider, bridge: Arc<dyn Bridge>) -> Result<()> {
        if provider.is_acp() {
            let driver = self.local_driver();
            driver.run(move || async move { bridge.start().await }).await
        } else {
            bridge.start().await
        }
    }

    pub async fn start(&self) -> Result<()> {
        let (provider, bridge) = self.current();
        self.start_on(provider, bridge).await
    }

    pub async fn stop(&self) -> Result<()> {
        let (_, bridge) = self.current();
        bridge.stop().await
    }

    async fn ensure_started(&self) -> Result<Arc<dyn Bridge>> {
        let (provider, bridge) = self.current();
        if bridge.state() == BridgeState::Disconnected {
            self.start_on(provider, bridge.clone()).await?;
        }
        Ok(bridge)
    }

    /// Pre-gates, sends, and post-processes one turn. See the component
    /// design's restart contract: a turn failure that leaves the bridge
    /// `Ready` is surfaced as-is; a turn failure that leaves it `Error`
    /// consumes one restart (if the budget allows) and is retried once.
    #[instrument(skip(self, prompt, attachments))]
    pub async fn chat(&self, prompt: &str, attachments: &[Attachment]) -> Result<Response> {
        let (provider, bridge) = self.current();

        if bridge.is_over_budget() {
            self.bus.emit(Event::new(
                provider,
                EventKind::Error {
                    error: format!("Budget exceeded: ${:.4}", bridge.total_cost()),
                    recoverable: false,
                },
            ));
            return Ok(Response::failure(format!("Budget exceeded: ${:.4}", bridge.total_cost())));
        }

        let bridge = self.ensure_started().await?;
        self.rate_limiter.acquire().await;

        let result = bridge.send(prompt, attachments).await;

        if bridge.state() == BridgeState::Error {
            let max_restarts = self.config.lock().unwrap().max_restarts;
            if self.restart_count.load(Ordering::SeqCst) < max_restarts {
                return self.restart_and_retry(provider, bridge, prompt, attachments).await;
            }
        }

        result
    }

    async fn restart_and_retry(
        &self,
        provider: Provider,
        bridge: Arc<dyn Bridge>,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<Response> {
        let count = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(provider = %provider.name(), restart_count = count, "bridge entered error state, restarting");
        self.bus.emit(Event::new(
            provider,
            EventKind::Error {
                error: format!("bridge restarting (attempt {count})"),
                recoverable: true,
            },
        ));
        let _ = bridge.stop().await;
        self.start_on(provider, bridge.clone()).await?;
        bridge.send(prompt, attachments).await
    }

    pub async fn chat_stream(&self, prompt: &str) -> Result<TextStream> {
        let bridge = self.ensure_started().await?;
        bridge.send_stream(prompt).await
    }

    pub async fn switch_provider(&self, provider: Provider) -> Result<()> {
        let (old_provider, old_bridge, new_agent_name, bridge_config) = {
            let active = self.active.lock().unwrap();
            let config = self.config.lock().unwrap();
            (active.provider, active.bridge.clone(), config.agent_name.clone(), config.bridge.clone())
        };
        let _ = old_bridge.stop().await;

        let new_bridge = build_bridge(provider, &new_agent_name, bridge_config, self.bus.clone())?;
        self.start_on(provider, new_bridge.clone()).await?;

        {
            let mut active = self.active.lock().unwrap();
            active.provider = provider;
            active.bridge = new_bridge;
        }
        self.restart_count.store(0, Ordering::SeqCst);
        info!(from = %old_provider.name(), to = %provider.name(), "switched provider");
        Ok(())
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        let (_, bridge) = self.current();
        bridge.resume_session(session_id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let (_, bridge) = self.current();
        bridge.list_sessions().await
    }

    pub fn history(&self) -> Vec<Message> {
        self.current().1.history()
    }

    pub fn clear_history(&self) {
        self.current().1.clear_history();
    }

    pub fn stats(&self) -> Stats {
        self.current().1.stats()
    }

    pub async fn health(&self) -> bool {
        self.current().1.check_health().await
    }

    pub fn is_healthy(&self) -> bool {
        self.current().1.is_healthy()
    }

    pub fn reset_restart_count(&self) {
        self.restart_count.store(0, Ordering::SeqCst);
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    pub fn current_provider(&self) -> Provider {
        self.current().0
    }

    pub fn session_id(&self) -> Option<String> {
        self.current().1.session_id()
    }

    pub fn is_warm(&self) -> bool {
        self.current().1.state() == BridgeState::Ready
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.current().1.capabilities()
    }

    pub fn session_capabilities(&self) -> SessionCapabilities {
        self.current().1.session_capabilities()
    }

    pub fn tool_policy(&self) -> ToolPolicy {
        self.current().1.tool_policy()
    }

    pub fn set_tool_policy(&self, policy: ToolPolicy) {
        self.current().1.set_tool_policy(policy)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Coarse UI-facing state derived from bridge state plus in-flight tool
    /// activity; never persisted, recomputed on every call.
    pub fn engine_state(&self) -> EngineState {
        match self.current().1.state() {
            BridgeState::Error => EngineState::Error,
            BridgeState::Busy if self.activity.active_count() > 0 => EngineState::ToolExecuting,
            BridgeState::Busy => EngineState::Responding,
            _ => EngineState::Idle,
        }
    }

    /// Starts the background loop that polls `is_healthy()` at the
    /// configured cadence (a no-op if no interval is configured).
    pub fn start_health_check_loop(self: &Arc<Self>) {
        let interval = self.config.lock().unwrap().health_check_interval;
        let Some(interval) = interval else { return };
        let engine = self.clone();
        let shutting_down = self.shutting_down.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                if !engine.health().await {
                    let (provider, bridge) = engine.current();
                    let max_restarts = engine.config.lock().unwrap().max_restarts;
                    let remaining = max_restarts.saturating_sub(engine.restart_count.load(Ordering::SeqCst));
                    engine.bus.emit(Event::new(
                        provider,
                        EventKind::Error {
                            error: "health check failed".to_string(),
                            recoverable: remaining > 0,
                        },
                    ));
                    if remaining > 0 {
                        engine.restart_count.fetch_add(1, Ordering::SeqCst);
                        let _ = bridge.stop().await;
                        let _ = engine.start_on(provider, bridge).await;
                    }
                }
            }
        });
        *self.health_task.lock().unwrap() = Some(task);
    }

    /// Registers SIGINT/SIGTERM handlers. Each handler does nothing beyond
    /// flipping `shutting_down` and spawning the actual shutdown as its own
    /// task, so no blocking work runs inside the signal future itself.
    #[cfg(unix)]
    pub fn install_signal_handlers(self: &Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};

        let engine = self.clone();
        let task = tokio::spawn(async move {
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to install SIGINT handler: {e}");
                    return;
                }
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
            engine.shutting_down.store(true, Ordering::SeqCst);
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = engine.stop().await;
            });
        });
        *self.signal_task.lock().unwrap() = Some(task);
    }

    pub fn remove_signal_handlers(&self) {
        if let Some(task) = self.signal_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Awaits graceful shutdown after `install_signal_handlers`, returning
    /// once `stop()` has run for a received signal.
    pub async fn run_until_signal(self: &Arc<Self>) {
        self.install_signal_handlers();
        while !self.shutting_down.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Wires the Activity Tracker to tool-lifecycle events on the bus, so a
/// `tool_use`/`tool_result` pair surfaces as the matching activity
/// start/complete without every bridge having to know about activities.
fn install_activity_bridge(bus: Arc<EventBus>, activity: Arc<ActivityTracker>) {
    let bus_for_handler = bus.clone();
    bus.subscribe(
        "tool",
        Arc::new(move |event: &Event| {
            let EventKind::Tool { tool_id, tool_name, status, error, .. } = &event.kind else {
                return;
            };
            match status {
                ToolStatus::Started => activity.start(&bus_for_handler, tool_id.clone(), "tool", tool_name.clone(), None),
                ToolStatus::Completed => activity.complete(&bus_for_handler, tool_id),
                ToolStatus::Failed => activity.fail(&bus_for_handler, tool_id, error.clone().unwrap_or_default()),
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.bridge.executable = "true".to_string();
        config.health_check_interval = None;
        config
    }

    #[tokio::test]
    async fn budget_gate_blocks_before_touching_the_bridge() {
        let mut config = test_config();
        config.bridge.max_budget_usd = Some(0.0);
        let engine = Engine::new(config).unwrap();

        let response = engine.chat("hi", &[]).await.unwrap();

        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Budget exceeded"));
        assert_eq!(engine.current().1.state(), BridgeState::Disconnected);
    }

    #[test]
    fn fresh_engine_reports_zero_restarts() {
        let engine = Engine::new(test_config()).unwrap();
        assert_eq!(engine.restart_count(), 0);
        engine.reset_restart_count();
        assert_eq!(engine.restart_count(), 0);
    }
}
