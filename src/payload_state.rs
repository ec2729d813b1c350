//! Per-channel payload history and change detection
//!
//! Kept separate from channel configuration so that overwriting a channel
//! does not disturb its history, and so change detection can update only
//! after a successful dispatch. A blocked or failed call must not poison
//! future comparisons.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

/// Stored payload entry
#[derive(Debug, Clone)]
pub struct PayloadEntry {
    /// Last accepted payload
    pub payload: Value,
    /// Monotonic per-channel sequence, bumped on every accepted payload
    pub version: u64,
    /// Where the payload came from ("call", "debounce", "schedule", ...)
    pub origin: String,
    /// When the payload was accepted
    pub updated_at: DateTime<Utc>,
}

/// Last-payload store with deep-equality change detection
///
/// Equality is structural over `serde_json::Value`: arrays elementwise,
/// objects by key set and recursive value equality, numbers by their JSON
/// representation (`1` and `1.0` are distinct). JSON cannot encode NaN,
/// so IEEE NaN semantics never arise.
#[derive(Debug, Default)]
pub struct PayloadState {
    entries: DashMap<String, PayloadEntry>,
}

impl PayloadState {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record an accepted payload for a channel
    pub fn set(&self, id: &str, payload: Value, origin: &str) {
        let mut entry = self.entries.entry(id.to_string()).or_insert(PayloadEntry {
            payload: Value::Null,
            version: 0,
            origin: origin.to_string(),
            updated_at: Utc::now(),
        });
        entry.version += 1;
        entry.payload = payload;
        entry.origin = origin.to_string();
        entry.updated_at = Utc::now();
    }

    /// Last accepted payload for a channel
    pub fn get(&self, id: &str) -> Option<PayloadEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    /// Whether `new_payload` differs from the last accepted payload
    ///
    /// Returns `true` when no payload has been accepted yet: the first
    /// call through a change-detecting channel always executes.
    pub fn has_changed(&self, id: &str, new_payload: &Value) -> bool {
        match self.entries.get(id) {
            Some(entry) => entry.payload != *new_payload,
            None => true,
        }
    }

    /// Drop history for a channel
    pub fn forget(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Drop all history
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of channels with recorded history
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_payload_always_counts_as_changed() {
        let state = PayloadState::new();
        assert!(state.has_changed("ch", &json!({"x": 1})));
    }

    #[test]
    fn identical_payload_is_unchanged() {
        let state = PayloadState::new();
        state.set("ch", json!({"x": 1, "y": [1, 2]}), "call");
        assert!(!state.has_changed("ch", &json!({"y": [1, 2], "x": 1})));
        assert!(state.has_changed("ch", &json!({"x": 1, "y": [1, 3]})));
        assert!(state.has_changed("ch", &json!({"x": 1})));
    }

    #[test]
    fn version_is_monotonic() {
        let state = PayloadState::new();
        state.set("ch", json!(1), "call");
        state.set("ch", json!(2), "call");
        state.set("ch", json!(3), "debounce");
        let entry = state.get("ch").unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.origin, "debounce");
    }

    #[test]
    fn forget_drops_history() {
        let state = PayloadState::new();
        state.set("ch", json!(1), "call");
        assert!(state.forget("ch"));
        assert!(!state.forget("ch"));
        assert!(state.has_changed("ch", &json!(1)));
    }

    #[test]
    fn integer_and_float_representations_differ() {
        let state = PayloadState::new();
        state.set("ch", json!(1), "call");
        assert!(state.has_changed("ch", &json!(1.0)));
    }
}
