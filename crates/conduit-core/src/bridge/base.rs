//! Shared bridge base (C8): lifecycle state, history, stats, stderr
//! classification, system-prompt injection, and budget/tool-policy gates
//! that both concrete variants embed by composition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::events::{DiagnosticLevel, Event, EventBus, EventKind};
use crate::sandbox::ConfigSandbox;
use crate::types::{BridgeState, Message, Provider, Stats, ToolPolicy};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub executable: String,
    pub model: Option<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub system_prompt: Option<String>,
    pub env: HashMap<String, String>,
    pub mcp_servers: Vec<(String, String, Vec<String>)>,
    pub tool_policy: ToolPolicy,
    pub max_budget_usd: Option<f64>,
    pub permission_mode: String,
    pub resume_session_id: Option<String>,
    pub continue_last: bool,
    pub max_turns: Option<u32>,
    pub fallback_model: Option<String>,
    pub json_schema: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            executable: String::new(),
            model: None,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout: Duration::from_secs(120),
            system_prompt: None,
            env: HashMap::new(),
            mcp_servers: Vec::new(),
            tool_policy: ToolPolicy::default(),
            max_budget_usd: None,
            permission_mode: "acceptEdits".to_string(),
            resume_session_id: None,
            continue_last: false,
            max_turns: None,
            fallback_model: None,
            json_schema: None,
        }
    }
}

pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(BridgeState, BridgeState) + Send + Sync>;
pub type StderrCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub struct BridgeCallbacks {
    pub on_output: StdMutex<Option<OutputCallback>>,
    pub on_state_change: StdMutex<Option<StateCallback>>,
    pub on_stderr: StdMutex<Option<StderrCallback>>,
}

impl BridgeCallbacks {
    pub fn set_on_output(&self, cb: OutputCallback) {
        *self.on_output.lock().unwrap() = Some(cb);
    }
    pub fn set_on_state_change(&self, cb: StateCallback) {
        *self.on_state_change.lock().unwrap() = Some(cb);
    }
    pub fn set_on_stderr(&self, cb: StderrCallback) {
        *self.on_stderr.lock().unwrap() = Some(cb);
    }

    fn fire_output(&self, text: &str) {
        if let Some(cb) = self.on_output.lock().unwrap().as_ref() {
            cb(text);
        }
    }
    fn fire_state(&self, old: BridgeState, new: BridgeState) {
        if let Some(cb) = self.on_state_change.lock().unwrap().as_ref() {
            cb(old, new);
        }
    }
    fn fire_stderr(&self, line: &str) {
        if let Some(cb) = self.on_stderr.lock().unwrap().as_ref() {
            cb(line);
        }
    }
}

/// Strips ANSI CSI/SGR escape sequences from a line of subprocess stderr.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub fn classify_stderr_level(line: &str) -> DiagnosticLevel {
    let lower = line.to_lowercase();
    if ["error", "fatal", "critical", "failed", "exception"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        DiagnosticLevel::Error
    } else if ["warn", "deprecated", "expir"].iter().any(|kw| lower.contains(kw)) {
        DiagnosticLevel::Warning
    } else if ["debug", "trace"].iter().any(|kw| lower.contains(kw)) {
        DiagnosticLevel::Debug
    } else {
        DiagnosticLevel::Info
    }
}

/// The mutable state shared by both bridge variants: lifecycle, history,
/// stats, callbacks, and the config sandbox.
pub struct BridgeCore {
    pub provider: Provider,
    pub config: BridgeConfig,
    pub sandbox: ConfigSandbox,
    pub bus: Arc<EventBus>,
    pub callbacks: BridgeCallbacks,

    state: StdMutex<BridgeState>,
    history: StdMutex<Vec<Message>>,
    stats: StdMutex<Stats>,
    session_id: StdMutex<Option<String>>,
    total_cost_usd: StdMutex<f64>,
    system_prompt_injected: std::sync::atomic::AtomicBool,
    stderr_ring: StdMutex<Vec<String>>,
}

const STDERR_RING_CAPACITY: usize = 200;

impl BridgeCore {
    pub fn new(provider: Provider, config: BridgeConfig, bus: Arc<EventBus>) -> crate::error::Result<Self> {
        let sandbox = ConfigSandbox::create(&format!("conduit-{}", provider.name()))?;
        Ok(Self {
            provider,
            config,
            sandbox,
            bus,
            callbacks: BridgeCallbacks::default(),
            state: StdMutex::new(BridgeState::Disconnected),
            history: StdMutex::new(Vec::new()),
            stats: StdMutex::new(Stats::default()),
            session_id: StdMutex::new(None),
            total_cost_usd: StdMutex::new(0.0),
            system_prompt_injected: std::sync::atomic::AtomicBool::new(false),
            stderr_ring: StdMutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap()
    }

    /// Only fires the callback/event when the state actually changes, to
    /// suppress UI churn from redundant transitions.
    pub fn set_state(&self, new: BridgeState) {
        let old = {
            let mut guard = self.state.lock().unwrap();
            let old = *guard;
            *guard = new;
            old
        };
        if old == new {
            return;
        }
        debug!(provider = ?self.provider, ?old, ?new, "bridge state transition");
        self.callbacks.fire_state(old, new);
        self.bus
            .emit(Event::new(self.provider, EventKind::State { old_state: old, new_state: new }));
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    pub fn set_session_id(&self, id: Option<String>) {
        *self.session_id.lock().unwrap() = id;
    }

    pub fn history(&self) -> Vec<Message> {
        self.history.lock().unwrap().clone()
    }

    pub fn push_history(&self, message: Message) {
        self.history.lock().unwrap().push(message);
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap().clear();
        self.system_prompt_injected
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().unwrap().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap() = Stats::default();
    }

    /// Updates stats exactly once per `send`, regardless of outcome.
    pub fn record_result(&self, success: bool, duration: Duration, cost_usd: Option<f64>, input_tokens: u64, output_tokens: u64) {
        let mut stats = self.stats.lock().unwrap();
        stats.total_requests += 1;
        if success {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }
        stats.total_duration_ms += duration.as_millis() as u64;
        if let Some(cost) = cost_usd {
            stats.total_cost_usd += cost;
            *self.total_cost_usd.lock().unwrap() += cost;
        }
        stats.total_input_tokens += input_tokens;
        stats.total_output_tokens += output_tokens;
    }

    pub fn total_cost(&self) -> f64 {
        *self.total_cost_usd.lock().unwrap()
    }

    pub fn is_over_budget(&self) -> bool {
        match self.config.max_budget_usd {
            Some(cap) => self.total_cost() >= cap,
            None => false,
        }
    }

    /// Prefixes the first user message with the system prompt, if one is
    /// configured and it has not already been injected. Idempotent across
    /// subsequent calls within the same bridge lifetime.
    pub fn maybe_inject_system_prompt(&self, prompt: &str) -> String {
        let Some(system_prompt) = &self.config.system_prompt else {
            return prompt.to_string();
        };
        if self
            .system_prompt_injected
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return prompt.to_string();
        }
        format!("[System: {system_prompt}]\n\n{prompt}")
    }

    pub fn tool_policy(&self) -> ToolPolicy {
        // ToolPolicy is cloned out of config at construction time; callers
        // needing live mutation use `set_tool_policy` on the owning bridge,
        // which replaces this snapshot via interior mutability in the variant.
        self.config.tool_policy.clone()
    }

    pub fn record_stderr_line(&self, raw_line: &str) {
        let clean = strip_ansi(raw_line);
        let level = classify_stderr_level(&clean);
        {
            let mut ring = self.stderr_ring.lock().unwrap();
            ring.push(clean.clone());
            if ring.len() > STDERR_RING_CAPACITY {
                ring.remove(0);
            }
        }
        self.callbacks.fire_stderr(&clean);
        match level {
            DiagnosticLevel::Error => error!(provider = ?self.provider, "{clean}"),
            DiagnosticLevel::Warning => warn!(provider = ?self.provider, "{clean}"),
            DiagnosticLevel::Debug => debug!(provider = ?self.provider, "{clean}"),
            DiagnosticLevel::Info => info!(provider = ?self.provider, "{clean}"),
        }
        self.bus.emit(Event::new(
            self.provider,
            EventKind::Diagnostic {
                message: clean,
                level,
                source: "stderr".to_string(),
            },
        ));
    }

    pub fn recent_stderr(&self) -> Vec<String> {
        self.stderr_ring.lock().unwrap().clone()
    }

    pub fn fire_output(&self, text: &str) {
        self.callbacks.fire_output(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_escape_sequences() {
        assert_eq!(strip_ansi("\u{1b}[31merror\u{1b}[0m"), "error");
        assert_eq!(strip_ansi("plain text"), "plain text");
    }

    #[test]
    fn ansi_stripping_is_involutive_on_clean_text() {
        let clean = "already clean, no escapes here";
        assert_eq!(strip_ansi(clean), clean);
    }

    #[test]
    fn classifies_stderr_by_keyword() {
        assert_eq!(classify_stderr_level("Fatal error occurred"), DiagnosticLevel::Error);
        assert_eq!(classify_stderr_level("this is deprecated"), DiagnosticLevel::Warning);
        assert_eq!(classify_stderr_level("debug: entering loop"), DiagnosticLevel::Debug);
        assert_eq!(classify_stderr_level("server listening on :8080"), DiagnosticLevel::Info);
    }

    #[test]
    fn state_setter_only_fires_on_actual_transition() {
        let bus = Arc::new(EventBus::new());
        let core = BridgeCore::new(Provider::StreamJson, BridgeConfig::default(), bus).unwrap();
        let calls = Arc::new(StdMutex::new(0));
        let c = calls.clone();
        core.callbacks
            .set_on_state_change(Arc::new(move |_, _| *c.lock().unwrap() += 1));

        core.set_state(BridgeState::WarmingUp);
        core.set_state(BridgeState::WarmingUp);
        core.set_state(BridgeState::Ready);

        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn system_prompt_is_injected_once() {
        let bus = Arc::new(EventBus::new());
        let mut config = BridgeConfig::default();
        config.system_prompt = Some("be concise".to_string());
        let core = BridgeCore::new(Provider::StreamJson, config, bus).unwrap();

        let first = core.maybe_inject_system_prompt("hello");
        let second = core.maybe_inject_system_prompt("hello again");

        assert!(first.contains("be concise"));
        assert_eq!(second, "hello again");
    }

    #[test]
    fn budget_gate_trips_at_or_above_cap() {
        let bus = Arc::new(EventBus::new());
        let mut config = BridgeConfig::default();
        config.max_budget_usd = Some(0.01);
        let core = BridgeCore::new(Provider::StreamJson, config, bus).unwrap();

        assert!(!core.is_over_budget());
        core.record_result(true, Duration::from_millis(1), Some(0.02), 0, 0);
        assert!(core.is_over_budget());
    }
}
