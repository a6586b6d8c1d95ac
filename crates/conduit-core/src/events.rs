//! Typed publish/subscribe event bus (C3) and the event taxonomy it carries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingPhase {
    General,
    Analyzing,
    Planning,
    Coding,
    Reviewing,
    ToolPlanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A discriminated, serializable event carried on the bus. Each variant
/// corresponds to one row of the taxonomy; every variant carries `timestamp`
/// and `provider` via the wrapping [`Event`] envelope fields below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Text {
        text: String,
        is_complete: bool,
    },
    Thinking {
        thought: String,
        phase: ThinkingPhase,
        subject: String,
        is_start: bool,
        is_complete: bool,
        block_id: String,
        token_count: Option<u64>,
    },
    Tool {
        tool_name: String,
        tool_id: String,
        parameters: serde_json::Value,
        status: ToolStatus,
        result: Option<String>,
        error: Option<String>,
    },
    State {
        old_state: crate::types::BridgeState,
        new_state: crate::types::BridgeState,
    },
    Cost {
        cost_usd: f64,
        input_tokens: u64,
        output_tokens: u64,
    },
    Error {
        error: String,
        recoverable: bool,
    },
    Diagnostic {
        message: String,
        level: DiagnosticLevel,
        source: String,
    },
    Activity {
        activity_id: String,
        parent_activity_id: Option<String>,
        activity_type: String,
        name: String,
        status: ActivityStatus,
        progress: Option<f32>,
        detail: Option<String>,
        concurrent_group: Option<String>,
        is_cancellable: bool,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
        options: Vec<String>,
    },
}

impl EventKind {
    /// The wire tag used by the WebSocket fan-out bridge; mirrors `serde`'s
    /// own `kind` tag so the two never drift apart.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::Text { .. } => "text",
            EventKind::Thinking { .. } => "thinking",
            EventKind::Tool { .. } => "tool",
            EventKind::State { .. } => "state",
            EventKind::Cost { .. } => "cost",
            EventKind::Error { .. } => "error",
            EventKind::Diagnostic { .. } => "diagnostic",
            EventKind::Activity { .. } => "activity",
            EventKind::PermissionRequest { .. } => "permission_request",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub provider: Provider,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(provider: Provider, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            provider,
            kind,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Opaque identity of a subscription, used only to unsubscribe.
#[derive(Clone)]
pub struct SubscriptionId(Arc<()>);

struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
}

/// Thread-safe typed pub/sub bus.
///
/// `emit` snapshots the subscriber lists under the lock, releases it, then
/// invokes handlers — so a handler is free to subscribe or unsubscribe
/// without deadlocking, and a panicking handler cannot prevent delivery to
/// the others (caught and logged, never propagated).
#[derive(Default)]
pub struct EventBus {
    by_tag: Mutex<HashMap<&'static str, Vec<Subscriber>>>,
    global: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events whose `tag()` matches `tag`.
    pub fn subscribe(&self, tag: &'static str, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(Arc::new(()));
        self.by_tag
            .lock()
            .unwrap()
            .entry(tag)
            .or_default()
            .push(Subscriber {
                id: id.clone(),
                handler,
            });
        id
    }

    /// Subscribe to every event regardless of tag.
    pub fn subscribe_any(&self, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(Arc::new(()));
        self.global.lock().unwrap().push(Subscriber {
            id: id.clone(),
            handler,
        });
        id
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) {
        let matches = |s: &Subscriber| Arc::ptr_eq(&s.id.0, &id.0);
        self.by_tag
            .lock()
            .unwrap()
            .values_mut()
            .for_each(|v| v.retain(|s| !matches(s)));
        self.global.lock().unwrap().retain(|s| !matches(s));
    }

    pub fn emit(&self, event: Event) {
        let tag = event.kind.tag();
        let tagged: Vec<Handler> = self
            .by_tag
            .lock()
            .unwrap()
            .get(tag)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();
        let global: Vec<Handler> = self
            .global
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.handler.clone())
            .collect();

        for handler in tagged.iter().chain(global.iter()) {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event)));
            if let Err(panic) = result {
                tracing::error!(?panic, tag, "event bus handler panicked");
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        let tagged: usize = self.by_tag.lock().unwrap().values().map(Vec::len).sum();
        tagged + self.global.lock().unwrap().len()
    }
}
