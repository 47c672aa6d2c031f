//! Lifecycle events published on the event bus.

use serde::{Deserialize, Serialize};

/// A lifecycle event. The `args` payload is the canonical JSON encoding of
/// whatever model the event concerns, so local and remote subscribers see
/// the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, one of the `EVENT_*` constants.
    pub name: String,

    /// Event payload.
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Event {
    /// Create an event with a payload.
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Create an event with no payload.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: serde_json::Value::Null,
        }
    }
}
