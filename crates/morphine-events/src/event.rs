//! Event values and topic naming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Global topic published after an extension becomes active.
pub const EXTENSION_LOADED: &str = "extensionLoaded";

/// Global topic published after an extension has been torn down.
pub const EXTENSION_UNLOADED: &str = "extensionUnloaded";

/// Prefix shared by every extension-scoped topic.
pub const EXTENSION_NAMESPACE: &str = "extension";

/// Build the namespaced topic `extension:<id>:<name>`.
#[must_use]
pub fn scoped_topic(extension_id: &str, name: &str) -> String {
    format!("{EXTENSION_NAMESPACE}:{extension_id}:{name}")
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Who published it: `host` or an extension id.
    pub source: String,
}

impl EventMetadata {
    /// Create metadata for an event published by `source`.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

/// A single message travelling over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Topic string; either global or `extension:<id>:<name>`.
    pub topic: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
    /// Event metadata.
    pub metadata: EventMetadata,
}

impl Event {
    /// Create an event on an arbitrary topic.
    #[must_use]
    pub fn new(source: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            metadata: EventMetadata::new(source),
        }
    }

    /// Event on the publishing extension's own namespace.
    #[must_use]
    pub fn scoped(extension_id: &str, name: &str, payload: Value) -> Self {
        Self::new(extension_id, scoped_topic(extension_id, name), payload)
    }

    /// Point-to-point message published under the *target's* namespace.
    ///
    /// The payload is wrapped as `{ "from": <sender>, "data": <data> }` so the
    /// receiver learns who sent it without holding a reference to the sender.
    #[must_use]
    pub fn direct(from: &str, target: &str, name: &str, data: Value) -> Self {
        Self::new(
            from,
            scoped_topic(target, name),
            json!({ "from": from, "data": data }),
        )
    }

    /// Lifecycle notification for a freshly activated extension.
    #[must_use]
    pub fn extension_loaded(extension_id: &str, manifest: Value) -> Self {
        Self::new(
            "host",
            EXTENSION_LOADED,
            json!({ "id": extension_id, "manifest": manifest }),
        )
    }

    /// Lifecycle notification for a removed extension.
    #[must_use]
    pub fn extension_unloaded(extension_id: &str) -> Self {
        Self::new("host", EXTENSION_UNLOADED, json!({ "id": extension_id }))
    }

    /// Whether the topic lives in an extension namespace.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.topic
            .strip_prefix(EXTENSION_NAMESPACE)
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_topic_format() {
        assert_eq!(scoped_topic("Products", "created"), "extension:Products:created");
    }

    #[test]
    fn test_direct_wraps_sender() {
        let event = Event::direct("A", "B", "ping", json!({ "x": 1 }));
        assert_eq!(event.topic, "extension:B:ping");
        assert_eq!(event.payload, json!({ "from": "A", "data": { "x": 1 } }));
        assert_eq!(event.metadata.source, "A");
        assert!(event.is_scoped());
    }

    #[test]
    fn test_lifecycle_events_are_global() {
        let loaded = Event::extension_loaded("Test", json!({ "version": "1" }));
        assert_eq!(loaded.topic, EXTENSION_LOADED);
        assert_eq!(loaded.payload["id"], "Test");
        assert!(!loaded.is_scoped());

        let unloaded = Event::extension_unloaded("Test");
        assert_eq!(unloaded.topic, EXTENSION_UNLOADED);
        assert_eq!(unloaded.payload, json!({ "id": "Test" }));
    }

    #[test]
    fn test_extensionless_prefix_is_not_scoped() {
        let event = Event::new("host", "extensionLoaded", Value::Null);
        assert!(!event.is_scoped());
    }
}
