//! Event fan-out.
//!
//! Handlers are registered per [`EventKind`]. The dispatcher lives on the
//! [`crate::RealtimeClient`], not on a link, so registrations survive
//! automatic reconnects and are only dropped by an explicit disconnect.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::message::{EventKind, ServerEvent};

/// Boxed event handler.
pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Routes events to the handlers registered for their kind.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: DashMap<EventKind, Vec<Handler>>,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.handlers.entry(kind).or_default().push(Arc::new(handler));
    }

    /// Forward every event of the given kinds into an unbounded channel.
    pub fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in kinds {
            let tx = tx.clone();
            self.on(*kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        rx
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, |h| h.len())
    }

    /// Deliver `event` to its handlers. Returns how many ran.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        // clone out so handlers may register more handlers themselves
        let handlers: Vec<Handler> = match self.handlers.get(&event.kind()) {
            Some(list) => list.iter().map(Arc::clone).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("kinds", &self.handlers.len())
            .finish_non_exhaustive()
    }
}
