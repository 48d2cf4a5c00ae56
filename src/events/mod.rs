//! In-process typed event bus.
//!
//! A fixed set of event names with statically associated payloads. `emit`
//! fans out to every registered handler in parallel; each handler runs
//! under its own timeout, and handler failures never propagate to other
//! handlers or to the emitter.

use futures_util::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Events published by the core components.
#[derive(Debug, Clone)]
pub enum Event {
    MessageInbound { jid: String, content: String },
    MessageOutbound { jid: String, content: String },
    AgentStart { jid: String },
    AgentStop { jid: String },
    TaskCreated { task_id: String, folder: String },
    TaskCompleted { task_id: String, status: String },
    PluginLoaded { name: String },
    PluginUnloaded { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageInbound,
    MessageOutbound,
    AgentStart,
    AgentStop,
    TaskCreated,
    TaskCompleted,
    PluginLoaded,
    PluginUnloaded,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageInbound => "message:inbound",
            Self::MessageOutbound => "message:outbound",
            Self::AgentStart => "agent:start",
            Self::AgentStop => "agent:stop",
            Self::TaskCreated => "task:created",
            Self::TaskCompleted => "task:completed",
            Self::PluginLoaded => "plugin:loaded",
            Self::PluginUnloaded => "plugin:unloaded",
        }
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageInbound { .. } => EventKind::MessageInbound,
            Self::MessageOutbound { .. } => EventKind::MessageOutbound,
            Self::AgentStart { .. } => EventKind::AgentStart,
            Self::AgentStop { .. } => EventKind::AgentStop,
            Self::TaskCreated { .. } => EventKind::TaskCreated,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::PluginLoaded { .. } => EventKind::PluginLoaded,
            Self::PluginUnloaded { .. } => EventKind::PluginUnloaded,
        }
    }
}

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Opaque registration handle returned by [`EventBus::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>>,
    next_id: Arc<AtomicU64>,
    handler_timeout: Duration,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_handler_timeout(Duration::from_secs(5))
    }

    pub fn with_handler_timeout(handler_timeout: Duration) -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            handler_timeout,
        }
    }

    /// Register a handler for one event kind.
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers
            .lock()
            .expect("event bus lock poisoned")
            .entry(kind)
            .or_default()
            .push((id, boxed));
        HandlerId(id)
    }

    /// Remove a previously registered handler. Unknown ids are a no-op.
    pub fn off(&self, kind: EventKind, id: HandlerId) {
        if let Some(list) = self
            .handlers
            .lock()
            .expect("event bus lock poisoned")
            .get_mut(&kind)
        {
            list.retain(|(hid, _)| *hid != id.0);
        }
    }

    /// Fan an event out to all handlers in parallel and wait until every
    /// handler has settled or timed out.
    pub async fn emit(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let guard = self.handlers.lock().expect("event bus lock poisoned");
            guard
                .get(&kind)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        if handlers.is_empty() {
            return;
        }

        let timeout = self.handler_timeout;
        let futures = handlers.into_iter().map(|handler| {
            let event = event.clone();
            async move {
                match tokio::time::timeout(timeout, handler(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(event = kind.as_str(), error = %e, "event handler failed");
                    }
                    Err(_) => {
                        warn!(
                            event = kind.as_str(),
                            timeout_ms = timeout.as_millis() as u64,
                            "event handler timed out"
                        );
                    }
                }
            }
        });
        join_all(futures).await;
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .expect("event bus lock poisoned")
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.handlers
            .lock()
            .expect("event bus lock poisoned")
            .clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
