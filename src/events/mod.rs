//! Event bus publishing lifecycle transitions to registered handlers.
//!
//! Registration is idempotent by handler identity. Delivery takes a
//! snapshot of the subscriber list under the bus mutex and dispatches
//! outside it, so handlers may register or unregister mid-delivery. Every
//! event round-trips through canonical JSON before dispatch so local and
//! remote subscribers observe the same shape.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CoreResult;
use crate::models::Event;

/// A subscriber on the event bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a delivered event.
    async fn handle_event(&self, event: Event) -> anyhow::Result<()>;

    /// Handle a failure raised by `handle_event`. Failures raised here are
    /// logged and swallowed.
    async fn handle_exception(&self, event: Event, error: anyhow::Error) -> anyhow::Result<()>;
}

type HandlerList = Vec<Arc<dyn EventHandler>>;

/// In-process event bus with at-least-once delivery per subscriber.
pub struct EventBus {
    handlers: Mutex<HashMap<String, HandlerList>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler for the named event. Duplicate registrations of
    /// the same handler are ignored with a warning.
    pub fn register_handler(&self, event_name: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.lock();
        let list = handlers.entry(event_name.to_string()).or_default();

        if list.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            log::warn!("handler already registered for event {}", event_name);
            return;
        }

        list.push(handler);
    }

    /// Remove a handler from the given events, or from every event when
    /// `events` is `None`.
    pub fn remove_handler(&self, handler: &Arc<dyn EventHandler>, events: Option<&[&str]>) {
        let mut handlers = self.handlers.lock();
        match events {
            Some(events) => {
                for event in events {
                    if let Some(list) = handlers.get_mut(*event) {
                        list.retain(|existing| !Arc::ptr_eq(existing, handler));
                    }
                }
            }
            None => {
                for list in handlers.values_mut() {
                    list.retain(|existing| !Arc::ptr_eq(existing, handler));
                }
            }
        }
    }

    /// Remove every registered handler.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    /// Snapshot of the handlers registered for the named event.
    pub fn get_handlers(&self, event_name: &str) -> HandlerList {
        self.handlers
            .lock()
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver an event to every registered handler. Handler failures are
    /// routed to `handle_exception`; secondary failures are logged and
    /// swallowed.
    pub async fn fire(&self, event: Event) -> CoreResult<()> {
        // round-trip so subscribers see the canonical encoding
        let encoded = serde_json::to_string(&event)?;
        let event: Event = serde_json::from_str(&encoded)?;

        let handlers = self.get_handlers(&event.name);
        for handler in handlers {
            if let Err(error) = handler.handle_event(event.clone()).await {
                if let Err(secondary) = handler.handle_exception(event.clone(), error).await {
                    log::error!(
                        "event handler exception handler failed for {}: {}",
                        event.name,
                        secondary
                    );
                }
            }
        }

        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub mod testing {
    //! Event collection helpers shared by unit and integration tests.

    use super::*;

    /// Records every delivered event.
    pub struct EventCollector {
        events: Mutex<Vec<Event>>,
    }

    impl EventCollector {
        /// Create an empty collector.
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        /// Names of every event seen, in delivery order.
        pub fn names(&self) -> Vec<String> {
            self.events.lock().iter().map(|e| e.name.clone()).collect()
        }

        /// How many events with the given name were seen.
        pub fn count(&self, name: &str) -> usize {
            self.events.lock().iter().filter(|e| e.name == name).count()
        }
    }

    #[async_trait]
    impl EventHandler for EventCollector {
        async fn handle_event(&self, event: Event) -> anyhow::Result<()> {
            self.events.lock().push(event);
            Ok(())
        }

        async fn handle_exception(
            &self,
            _event: Event,
            _error: anyhow::Error,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
