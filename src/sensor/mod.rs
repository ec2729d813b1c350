//! Sensor: append-only runtime event stream
//!
//! Every notable runtime occurrence lands here as a [`SensorEvent`]:
//! calls, dispatches, executions, pipeline denials, scheduler activity,
//! and system transitions. The sensor keeps a bounded log with
//! oldest-first eviction, a fixed-size live ring for subscribers, and
//! incremental aggregates (system totals, per-channel counters, a moving
//! call-rate window) so the breathing subsystem can read load cheaply.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::constants::{CALL_RATE_WINDOW_MS, SENSOR_LIVE_RING_CAPACITY, SENSOR_RETENTION_MAX};
use crate::error::BusResult;
use crate::types::PriorityLevel;

/// Closed set of event types the sensor records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Call,
    Dispatch,
    Execution,
    Error,
    Throttle,
    Debounce,
    Skip,
    Middleware,
    Intralink,
    Timeout,
    System,
    Blocked,
    Debug,
    Info,
    Warning,
    Critical,
    Success,
    Other,
}

/// One recorded runtime occurrence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorEvent {
    /// Unique event id
    pub id: String,
    /// Wall-clock timestamp
    pub timestamp: DateTime<Utc>,
    /// Channel or subsystem the event belongs to
    pub action_id: String,
    /// Event type
    pub kind: EventKind,
    /// Where in the runtime the event was emitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Priority of the originating channel, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<PriorityLevel>,
    /// Free-form structured detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SensorEvent {
    /// New event with a generated id and the current timestamp
    pub fn new(kind: EventKind, action_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action_id: action_id.into(),
            kind,
            location: None,
            priority: None,
            metadata: None,
        }
    }

    /// Attach a location
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Attach structured metadata
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach the originating channel's priority
    pub fn with_priority(mut self, priority: PriorityLevel) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Filter over recorded events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Match only these kinds (empty matches every kind)
    #[serde(default)]
    pub kinds: Vec<EventKind>,
    /// Match only this channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    /// Match only this location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Events at or after this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Events at or before this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Filter matching every event
    pub fn any() -> Self {
        Self::default()
    }

    /// Filter on a single kind
    pub fn kind(kind: EventKind) -> Self {
        Self {
            kinds: vec![kind],
            ..Default::default()
        }
    }

    /// Filter on a channel id
    pub fn channel(id: impl Into<String>) -> Self {
        Self {
            action_id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Whether an event passes this filter
    pub fn matches(&self, event: &SensorEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(action_id) = &self.action_id {
            if &event.action_id != action_id {
                return false;
            }
        }
        if let Some(location) = &self.location {
            if event.location.as_deref() != Some(location.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Per-channel aggregate counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelCounters {
    /// Calls observed for the channel
    pub calls: u64,
    /// Errors observed for the channel
    pub errors: u64,
    /// Dispatches that reached the handler
    pub dispatches: u64,
    /// Timestamp of the most recent call
    pub last_call: Option<DateTime<Utc>>,
}

/// Live subscription callback
///
/// A callback returning `Err` is deactivated and receives no further
/// events.
pub type SubscriberFn = Arc<dyn Fn(&SensorEvent) -> BusResult<()> + Send + Sync>;

struct Subscription {
    id: String,
    filter: EventFilter,
    callback: SubscriberFn,
    active: AtomicBool,
}

/// Append-only sensor log with aggregates and live subscriptions
pub struct Sensor {
    log: Mutex<VecDeque<SensorEvent>>,
    live_ring: Mutex<VecDeque<SensorEvent>>,
    subscribers: RwLock<Vec<Subscription>>,
    totals: Mutex<HashMap<EventKind, u64>>,
    channel_counters: DashMap<String, ChannelCounters>,
    call_window: Mutex<VecDeque<Instant>>,
    retention_max: usize,
}

impl Sensor {
    /// New sensor with the default retention bound
    pub fn new() -> Self {
        Self::with_retention(SENSOR_RETENTION_MAX)
    }

    /// New sensor with a custom retention bound
    pub fn with_retention(retention_max: usize) -> Self {
        Self {
            log: Mutex::new(VecDeque::new()),
            live_ring: Mutex::new(VecDeque::with_capacity(SENSOR_LIVE_RING_CAPACITY)),
            subscribers: RwLock::new(Vec::new()),
            totals: Mutex::new(HashMap::new()),
            channel_counters: DashMap::new(),
            call_window: Mutex::new(VecDeque::new()),
            retention_max,
        }
    }

    /// Record an event: append, aggregate, and notify matching subscribers
    pub fn record(&self, event: SensorEvent) {
        {
            let mut totals = self.totals.lock();
            *totals.entry(event.kind).or_insert(0) += 1;
        }

        {
            let mut counters = self
                .channel_counters
                .entry(event.action_id.clone())
                .or_default();
            match event.kind {
                EventKind::Call => {
                    counters.calls += 1;
                    counters.last_call = Some(event.timestamp);
                }
                EventKind::Dispatch => counters.dispatches += 1,
                EventKind::Error | EventKind::Timeout => counters.errors += 1,
                _ => {}
            }
        }

        if event.kind == EventKind::Call {
            let mut window = self.call_window.lock();
            let now = Instant::now();
            window.push_back(now);
            Self::prune_window(&mut window, now);
        }

        self.notify(&event);

        {
            let mut ring = self.live_ring.lock();
            if ring.len() >= SENSOR_LIVE_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let mut log = self.log.lock();
        if log.len() >= self.retention_max {
            log.pop_front();
        }
        log.push_back(event);
    }

    /// Shorthand: record a bare event for a channel
    pub fn emit(&self, kind: EventKind, action_id: &str, location: &str) {
        self.record(SensorEvent::new(kind, action_id).at(location));
    }

    fn notify(&self, event: &SensorEvent) {
        let subscribers = self.subscribers.read();
        for sub in subscribers.iter() {
            if !sub.active.load(Ordering::Acquire) {
                continue;
            }
            if !sub.filter.matches(event) {
                continue;
            }
            if (sub.callback)(event).is_err() {
                sub.active.store(false, Ordering::Release);
                tracing::warn!(subscription = %sub.id, "sensor subscriber failed, deactivating");
            }
        }
    }

    /// Register a live subscription; returns its id
    pub fn subscribe(&self, filter: EventFilter, callback: SubscriberFn) -> String {
        let id = Uuid::new_v4().to_string();
        self.subscribers.write().push(Subscription {
            id: id.clone(),
            filter,
            callback,
            active: AtomicBool::new(true),
        });
        id
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Export events newest-first with a filter, limit, and offset
    pub fn export(&self, filter: &EventFilter, limit: usize, offset: usize) -> Vec<SensorEvent> {
        let log = self.log.lock();
        log.iter()
            .rev()
            .filter(|e| filter.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Snapshot of the live ring, oldest-first
    pub fn live_snapshot(&self) -> Vec<SensorEvent> {
        self.live_ring.lock().iter().cloned().collect()
    }

    /// Snapshot of system-wide totals per event kind
    pub fn totals(&self) -> HashMap<EventKind, u64> {
        self.totals.lock().clone()
    }

    /// Total for a single kind
    pub fn total(&self, kind: EventKind) -> u64 {
        self.totals.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Aggregate counters for one channel
    pub fn channel_counters(&self, id: &str) -> Option<ChannelCounters> {
        self.channel_counters.get(id).map(|c| c.clone())
    }

    /// Calls observed within the moving window, as calls per second
    pub fn calls_per_second(&self) -> f64 {
        let mut window = self.call_window.lock();
        let now = Instant::now();
        Self::prune_window(&mut window, now);
        window.len() as f64 * 1000.0 / CALL_RATE_WINDOW_MS as f64
    }

    fn prune_window(window: &mut VecDeque<Instant>, now: Instant) {
        let horizon = std::time::Duration::from_millis(CALL_RATE_WINDOW_MS);
        while let Some(front) = window.front() {
            if now.duration_since(*front) > horizon {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop aggregates for a channel (part of the `forget` cascade)
    pub fn forget_channel(&self, id: &str) {
        self.channel_counters.remove(id);
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    /// Drop the log, ring, and aggregates (subscriptions survive)
    pub fn clear(&self) {
        self.log.lock().clear();
        self.live_ring.lock().clear();
        self.totals.lock().clear();
        self.channel_counters.clear();
        self.call_window.lock().clear();
    }
}

impl Default for Sensor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn record_and_export_newest_first() {
        let sensor = Sensor::new();
        sensor.emit(EventKind::Call, "a", "runtime");
        sensor.emit(EventKind::Dispatch, "a", "runtime");
        sensor.emit(EventKind::Call, "b", "runtime");

        let all = sensor.export(&EventFilter::any(), 10, 0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action_id, "b");

        let calls = sensor.export(&EventFilter::kind(EventKind::Call), 10, 0);
        assert_eq!(calls.len(), 2);

        let offset = sensor.export(&EventFilter::any(), 10, 1);
        assert_eq!(offset.len(), 2);
    }

    #[test]
    fn retention_evicts_oldest_first() {
        let sensor = Sensor::with_retention(3);
        for i in 0..5 {
            sensor.record(SensorEvent::new(EventKind::Info, format!("ch{i}")));
        }
        assert_eq!(sensor.len(), 3);
        let events = sensor.export(&EventFilter::any(), 10, 0);
        assert_eq!(events[0].action_id, "ch4");
        assert_eq!(events[2].action_id, "ch2");
    }

    #[test]
    fn channel_counters_track_calls_and_errors() {
        let sensor = Sensor::new();
        sensor.emit(EventKind::Call, "ch", "runtime");
        sensor.emit(EventKind::Call, "ch", "runtime");
        sensor.emit(EventKind::Dispatch, "ch", "runtime");
        sensor.emit(EventKind::Error, "ch", "runtime");

        let counters = sensor.channel_counters("ch").unwrap();
        assert_eq!(counters.calls, 2);
        assert_eq!(counters.dispatches, 1);
        assert_eq!(counters.errors, 1);
        assert!(counters.last_call.is_some());

        sensor.forget_channel("ch");
        assert!(sensor.channel_counters("ch").is_none());
    }

    #[test]
    fn subscriber_receives_matching_events_only() {
        let sensor = Sensor::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        sensor.subscribe(
            EventFilter::kind(EventKind::Error),
            Arc::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        sensor.emit(EventKind::Call, "ch", "runtime");
        sensor.emit(EventKind::Error, "ch", "runtime");
        sensor.emit(EventKind::Error, "other", "runtime");

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_subscriber_is_deactivated() {
        let sensor = Sensor::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        sensor.subscribe(
            EventFilter::any(),
            Arc::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::BusError::Internal("boom".into()))
            }),
        );

        sensor.emit(EventKind::Info, "ch", "runtime");
        sensor.emit(EventKind::Info, "ch", "runtime");

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_subscription() {
        let sensor = Sensor::new();
        let id = sensor.subscribe(EventFilter::any(), Arc::new(|_| Ok(())));
        assert!(sensor.unsubscribe(&id));
        assert!(!sensor.unsubscribe(&id));
    }

    #[test]
    fn filter_matches_metadata_free_fields() {
        let event = SensorEvent::new(EventKind::Blocked, "ch")
            .at("pipeline")
            .with_metadata(json!({"reason": "throttled"}));

        assert!(EventFilter::channel("ch").matches(&event));
        assert!(!EventFilter::channel("other").matches(&event));

        let location_filter = EventFilter {
            location: Some("pipeline".into()),
            ..Default::default()
        };
        assert!(location_filter.matches(&event));
    }
}
