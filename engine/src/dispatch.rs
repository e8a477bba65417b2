//! Event fan-out.
//!
//! Every component sees every event; each one ignores what it does not
//! care about. Handlers run concurrently and never fail.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, trace};

use keel_types::HostEvent;

use crate::compaction::CompactionOrchestrator;
use crate::continuation::IdleNudge;
use crate::pruning::PruningService;
use crate::recovery::SessionRecovery;
use crate::self_loop::SelfLoop;

pub type HandlerFut<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle<'a>(&'a self, event: &'a HostEvent) -> HandlerFut<'a>;
}

impl EventHandler for SessionRecovery {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn handle<'a>(&'a self, event: &'a HostEvent) -> HandlerFut<'a> {
        Box::pin(self.handle_event(event))
    }
}

impl EventHandler for CompactionOrchestrator {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn handle<'a>(&'a self, event: &'a HostEvent) -> HandlerFut<'a> {
        Box::pin(self.handle_event(event))
    }
}

impl EventHandler for PruningService {
    fn name(&self) -> &'static str {
        "pruning"
    }

    fn handle<'a>(&'a self, event: &'a HostEvent) -> HandlerFut<'a> {
        self.handle_event(event);
        Box::pin(std::future::ready(()))
    }
}

impl EventHandler for IdleNudge {
    fn name(&self) -> &'static str {
        "idle-nudge"
    }

    fn handle<'a>(&'a self, event: &'a HostEvent) -> HandlerFut<'a> {
        Box::pin(self.handle_event(event))
    }
}

impl EventHandler for SelfLoop {
    fn name(&self) -> &'static str {
        "self-loop"
    }

    fn handle<'a>(&'a self, event: &'a HostEvent) -> HandlerFut<'a> {
        Box::pin(self.handle_event(event))
    }
}

#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    #[must_use]
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    pub async fn dispatch(&self, event: &HostEvent) {
        trace!(session = %event.session_id(), handlers = self.handlers.len(), "Dispatching event");
        join_all(self.handlers.iter().map(|handler| handler.handle(event))).await;
    }

    /// Parse a raw host event and dispatch it. Returns `false` for events the
    /// engine does not recognise.
    pub async fn dispatch_value(&self, raw: &Value) -> bool {
        let Some(event) = HostEvent::from_value(raw) else {
            let kind = raw.get("type").and_then(Value::as_str);
            debug!(kind = ?kind, "Ignoring unrecognised event");
            return false;
        };
        self.dispatch(&event).await;
        true
    }
}
