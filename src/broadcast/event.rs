// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::persist::unix_now_ms;

/// Kind used for keepalive events.
pub const HEARTBEAT_KIND: &str = "heartbeat";

/// An update pushed to subscribers.
///
/// Immutable once built; every subscriber receives its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Resource the event is about (e.g. `"radarr:queue"`)
    pub subject_id: String,
    /// Status or event kind (e.g. `"online"`, `"updated"`)
    pub kind: String,
    pub payload: Map<String, Value>,
    /// Unix milliseconds
    pub timestamp: i64,
    /// Set only by [`Event::heartbeat`]
    #[serde(skip)]
    keepalive: bool,
}

impl Event {
    pub fn new(subject_id: impl Into<String>, kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            subject_id: subject_id.into(),
            kind: kind.into(),
            payload,
            timestamp: unix_now_ms() as i64,
            keepalive: false,
        }
    }

    /// Build an event from any JSON value. Objects become the payload as-is,
    /// anything else is wrapped as `{"data": value}`.
    pub fn from_value(subject_id: impl Into<String>, kind: impl Into<String>, value: Value) -> Self {
        let payload = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self::new(subject_id, kind, payload)
    }

    /// Keepalive event. Only this constructor produces one; an ordinary
    /// event that happens to use [`HEARTBEAT_KIND`] is delivered as data.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            keepalive: true,
            ..Self::new("", HEARTBEAT_KIND, Map::new())
        }
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.keepalive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_value_becomes_payload() {
        let event = Event::from_value("plex:sessions", "online", json!({"streams": 2}));
        assert_eq!(event.payload.get("streams"), Some(&json!(2)));
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_scalar_value_is_wrapped() {
        let event = Event::from_value("sonarr:queue", "updated", json!([1, 2]));
        assert_eq!(event.payload.get("data"), Some(&json!([1, 2])));
    }

    #[test]
    fn test_heartbeat() {
        assert!(Event::heartbeat().is_heartbeat());
        assert!(!Event::from_value("x", "online", json!({})).is_heartbeat());
        assert!(!Event::from_value("x", HEARTBEAT_KIND, json!({"n": 1})).is_heartbeat());
    }
}
