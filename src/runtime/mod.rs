//! Bus runtime: the public facade and wiring
//!
//! One [`Bus`] value owns every component: stores, payload history,
//! sensor, breathing state, TimeKeeper, and groups. There are no process
//! globals; clone the handle to share it. The bus must be created inside
//! a tokio runtime, since the quartz tick and the breathing ticker are
//! spawned tasks.

mod dispatch;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::breathing::{BreathingState, DefaultProbe, MetricsState, SystemFlags, SystemProbe};
use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::constants::BREATHING_RATE_BASE_MS;
use crate::error::BusResult;
use crate::groups::{Group, GroupConfig, GroupStore};
use crate::payload_state::PayloadState;
use crate::pipeline::compile;
use crate::response::Response;
use crate::sensor::{
    ChannelCounters, EventFilter, EventKind, Sensor, SensorEvent, SubscriberFn,
};
use crate::stores::Stores;
use crate::timekeeper::{TimeKeeper, TimeKeeperStats, TimerCallback};
use crate::types::{Handler, HandlerOutcome, Repeat};

/// Formation id of the breathing ticker
const BREATHING_FORMATION_ID: &str = "system::breathing";

pub(crate) struct BusInner {
    pub(crate) stores: Stores,
    pub(crate) payloads: PayloadState,
    pub(crate) sensor: Arc<Sensor>,
    pub(crate) metrics: Arc<MetricsState>,
    pub(crate) timekeeper: TimeKeeper,
    pub(crate) groups: GroupStore,
    pub(crate) probe: Arc<dyn SystemProbe>,
    pub(crate) breathing_rate_ms: AtomicU64,
    pub(crate) started_at: Instant,
}

/// The reactive action bus
///
/// Cheap to clone; all clones share the same runtime state.
#[derive(Clone)]
pub struct Bus {
    pub(crate) inner: Arc<BusInner>,
}

/// Builder for a [`Bus`] with a custom system probe
pub struct BusBuilder {
    probe: Arc<dyn SystemProbe>,
}

impl BusBuilder {
    /// Install a system probe sampled on every breath
    pub fn with_probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Build the bus and start its breathing ticker
    pub fn build(self) -> Bus {
        let metrics = Arc::new(MetricsState::new());
        let sensor = Arc::new(Sensor::new());
        let timekeeper = TimeKeeper::new(metrics.clone(), sensor.clone());
        let bus = Bus {
            inner: Arc::new(BusInner {
                stores: Stores::new(),
                payloads: PayloadState::new(),
                sensor,
                metrics,
                timekeeper,
                groups: GroupStore::new(),
                probe: self.probe,
                breathing_rate_ms: AtomicU64::new(BREATHING_RATE_BASE_MS),
                started_at: Instant::now(),
            }),
        };
        bus.register_breathing(BREATHING_RATE_BASE_MS);
        bus
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// New bus with the default probe
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Builder for a customized bus
    pub fn builder() -> BusBuilder {
        BusBuilder {
            probe: Arc::new(DefaultProbe),
        }
    }

    // ---- registration -------------------------------------------------

    /// Register or replace a channel
    ///
    /// Matching active groups apply their shared configuration before the
    /// protection pipeline is compiled. Replacing a channel cancels its
    /// in-flight debounce and schedule timers.
    pub fn action(&self, config: ChannelConfig) -> Response {
        let flags = self.inner.metrics.flags();
        if !flags.can_register {
            return Response::err("Registration refused", flags.reasons.join("; "));
        }

        let id = config.id.clone();
        let mut matching = self.inner.groups.matching(&id);
        // An explicit group id joins even without a pattern match.
        if let Some(group_id) = &config.group {
            if let Some(explicit) = self.inner.groups.get(group_id) {
                if explicit.is_active() && !matching.iter().any(|g| g.id == explicit.id) {
                    matching.push(explicit);
                }
            }
        }
        let mut merged = config;
        for group in &matching {
            merged = group.shared.apply(merged);
        }

        let channel = match compile(merged) {
            Ok(channel) => Arc::new(channel),
            Err(err) => {
                self.inner.sensor.record(
                    SensorEvent::new(EventKind::Error, &id)
                        .at("registration")
                        .with_metadata(serde_json::json!({ "error": err.to_string() })),
                );
                return Response::err("Invalid channel configuration", err.to_string());
            }
        };

        if let Some(prev) = self.inner.stores.insert_channel(channel.clone()) {
            self.inner.timekeeper.forget(&id);
            self.inner.timekeeper.forget(&prev.debounce_timer_id());
            tracing::debug!(channel = %id, "channel replaced, pending timers cancelled");
        }
        for group in &matching {
            group.add_member(&id);
        }

        self.inner
            .sensor
            .record(SensorEvent::new(EventKind::Info, &id).at("registration"));
        if channel.is_blocked {
            let reason = channel
                .block_reason
                .clone()
                .unwrap_or_else(|| "blocked".to_string());
            return Response::ok(None, format!("Channel registered (blocked: {reason})"));
        }
        Response::ok(None, "Channel registered")
    }

    /// Register or replace the handler for a channel
    pub fn on<F, Fut>(&self, id: &str, handler: F) -> Response
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<HandlerOutcome>> + Send + 'static,
    {
        self.on_handler(id, Arc::new(move |payload| Box::pin(handler(payload))))
    }

    /// Register a pre-boxed handler
    pub fn on_handler(&self, id: &str, handler: Handler) -> Response {
        let flags = self.inner.metrics.flags();
        if !flags.can_register {
            return Response::err("Registration refused", flags.reasons.join("; "));
        }
        if id.trim().is_empty() {
            return Response::err(
                "Invalid handler registration",
                "id must be a non-empty string",
            );
        }
        let replaced = self.inner.stores.insert_handler(id, handler);
        let message = if replaced {
            "Handler replaced"
        } else {
            "Handler registered"
        };
        Response::ok(None, message)
    }

    /// Remove a channel and everything that hangs off it
    ///
    /// Cancels pending debounce and schedule timers first, so no handler
    /// invocation for this id can occur after `forget` returns. An
    /// in-flight handler is not interrupted, but its result update is
    /// discarded.
    pub fn forget(&self, id: &str) -> bool {
        self.inner.timekeeper.forget(id);
        self.inner.timekeeper.forget(&format!("{id}::debounce"));
        let existed = self.inner.stores.remove_channel(id).is_some();
        self.inner.stores.remove_handler(id);
        self.inner.payloads.forget(id);
        self.inner.sensor.forget_channel(id);
        for group in self.inner.groups.all() {
            group.remove_member(id);
        }
        if existed {
            self.inner
                .sensor
                .record(SensorEvent::new(EventKind::System, id).at("forget"));
        }
        existed
    }

    /// Remove every channel, handler, payload history entry, per-channel
    /// stat, and channel-owned timer
    pub fn clear(&self) {
        for id in self.inner.stores.channel_ids() {
            self.inner.timekeeper.forget(&id);
            self.inner.timekeeper.forget(&format!("{id}::debounce"));
            self.inner.sensor.forget_channel(&id);
            for group in self.inner.groups.all() {
                group.remove_member(&id);
            }
        }
        self.inner.stores.clear();
        self.inner.payloads.clear();
        self.inner
            .sensor
            .record(SensorEvent::new(EventKind::System, "bus").at("clear"));
    }

    // ---- groups -------------------------------------------------------

    /// Create or replace a channel group
    ///
    /// Shared configuration is merged into every existing matching
    /// channel (recompiling its pipeline) and into channels registered
    /// later. An alert policy registers a monitoring formation.
    pub fn group(&self, id: &str, config: GroupConfig) -> Response {
        let flags = self.inner.metrics.flags();
        if !flags.can_register {
            return Response::err("Registration refused", flags.reasons.join("; "));
        }

        let group = match Group::new(id, config) {
            Ok(group) => Arc::new(group),
            Err(err) => return Response::err("Invalid group configuration", err.to_string()),
        };

        // Re-register matching channels with the shared config merged in.
        let mut joined = 0usize;
        for channel in self.inner.stores.channels() {
            let channel_id = channel.config.id.clone();
            if !group.matches(&channel_id) {
                continue;
            }
            let merged = group.shared.apply(channel.config.clone());
            match compile(merged) {
                Ok(recompiled) => {
                    self.inner.timekeeper.forget(&channel_id);
                    self.inner.timekeeper.forget(&channel.debounce_timer_id());
                    self.inner.stores.insert_channel(Arc::new(recompiled));
                    group.add_member(&channel_id);
                    joined += 1;
                }
                Err(err) => {
                    self.inner.sensor.record(
                        SensorEvent::new(EventKind::Warning, &channel_id)
                            .at("group")
                            .with_metadata(serde_json::json!({
                                "group": id,
                                "error": err.to_string(),
                            })),
                    );
                }
            }
        }

        if let Some(prev) = self.inner.groups.insert(group.clone()) {
            self.inner.timekeeper.forget(&prev.monitor_timer_id());
        }
        if group.alerts.is_some() {
            self.register_group_monitor(&group);
        }

        self.inner
            .sensor
            .record(SensorEvent::new(EventKind::Info, id).at("group"));
        Response::ok(
            None,
            format!("Group registered with {joined} matching channel(s)"),
        )
    }

    /// Replace a group's configuration
    pub fn update_group(&self, id: &str, config: GroupConfig) -> Response {
        if self.inner.groups.get(id).is_none() {
            return Response::err(format!("Group {id} not found"), "unknown group");
        }
        self.group(id, config)
    }

    /// Remove a group; stops auto-joins and its monitor, keeps past merges
    pub fn remove_group(&self, id: &str) -> bool {
        match self.inner.groups.remove(id) {
            Some(group) => {
                self.inner.timekeeper.forget(&group.monitor_timer_id());
                true
            }
            None => false,
        }
    }

    /// Fetch a group handle
    pub fn get_group(&self, id: &str) -> Option<Arc<Group>> {
        self.inner.groups.get(id)
    }

    fn register_group_monitor(&self, group: &Arc<Group>) {
        let Some(alerts) = group.alerts.clone() else {
            return;
        };
        let interval = alerts.monitor_interval_ms();
        let bus = self.clone();
        let group_for_callback = group.clone();
        let callback: TimerCallback = Arc::new(move || {
            let bus = bus.clone();
            let group = group_for_callback.clone();
            Box::pin(async move {
                bus.check_group_members(&group);
                Ok(())
            })
        });
        if let Err(err) = self.inner.timekeeper.keep(
            interval,
            callback,
            Repeat::Forever,
            Some(group.monitor_timer_id()),
            None,
        ) {
            tracing::warn!(group = %group.id, error = %err, "failed to register group monitor");
        }
    }

    fn check_group_members(&self, group: &Arc<Group>) {
        let Some(alerts) = group.alerts.as_ref() else {
            return;
        };
        let threshold = chrono::Duration::milliseconds(alerts.offline_threshold_ms as i64);
        let now = Utc::now();

        for member in group.members() {
            let Some(channel) = self.inner.stores.channel(&member) else {
                group.remove_member(&member);
                continue;
            };
            let last_seen = self
                .inner
                .sensor
                .channel_counters(&member)
                .and_then(|c| c.last_call)
                .unwrap_or(channel.created_at);
            let offline = now - last_seen > threshold;

            if offline {
                let newly = group.alert_states.insert(member.clone(), true).is_none();
                if newly {
                    self.inner.sensor.record(
                        SensorEvent::new(EventKind::Critical, &member)
                            .at("group-monitor")
                            .with_metadata(serde_json::json!({
                                "group": group.id,
                                "reason": "channel offline",
                                "threshold_ms": alerts.offline_threshold_ms,
                            })),
                    );
                    if let Some(handler) = &alerts.handler {
                        handler(&member);
                    }
                }
            } else {
                group.alert_states.remove(&member);
            }
        }
    }

    // ---- scheduler pass-throughs -------------------------------------

    /// Pause one channel's formation, or all formations
    pub fn pause(&self, channel_id: Option<&str>) -> usize {
        self.inner.timekeeper.pause(channel_id)
    }

    /// Resume one channel's formation, or all formations
    pub fn resume(&self, channel_id: Option<&str>) -> usize {
        self.inner.timekeeper.resume(channel_id)
    }

    /// Stop the scheduler and clear every formation
    pub fn hibernate(&self) {
        self.inner.timekeeper.hibernate();
    }

    /// Leave hibernation, clear scheduler state, and restart breathing
    pub fn reset(&self) {
        self.inner.timekeeper.reset();
        self.inner.metrics.reset_breathing();
        self.inner
            .breathing_rate_ms
            .store(BREATHING_RATE_BASE_MS, Ordering::Relaxed);
        self.register_breathing(BREATHING_RATE_BASE_MS);
    }

    /// Lock registrations; calls still pass
    pub fn lock(&self) {
        self.inner.metrics.lock();
        self.inner
            .sensor
            .record(SensorEvent::new(EventKind::System, "bus").at("lock"));
    }

    /// Unlock registrations
    pub fn unlock(&self) {
        self.inner.metrics.unlock();
        self.inner
            .sensor
            .record(SensorEvent::new(EventKind::System, "bus").at("unlock"));
    }

    /// Shut the bus down; every gate closes until the process restarts
    pub fn shutdown(&self) {
        self.inner.metrics.shutdown();
        self.inner.timekeeper.hibernate();
        self.inner
            .sensor
            .record(SensorEvent::new(EventKind::System, "bus").at("shutdown"));
    }

    // ---- breathing ----------------------------------------------------

    fn register_breathing(&self, rate_ms: u64) {
        let bus = self.clone();
        let callback: TimerCallback = Arc::new(move || {
            let bus = bus.clone();
            Box::pin(async move {
                bus.take_breath();
                Ok(())
            })
        });
        if let Err(err) = self.inner.timekeeper.keep(
            rate_ms,
            callback,
            Repeat::Forever,
            Some(BREATHING_FORMATION_ID.to_string()),
            None,
        ) {
            tracing::warn!(error = %err, "failed to register breathing ticker");
        }
    }

    /// One breathing tick: sample, recompute stress and flags, adapt rate
    pub(crate) fn take_breath(&self) {
        let sample = self.inner.probe.sample();
        let call_rate = self.inner.sensor.calls_per_second();
        let outcome = self.inner.metrics.breathe(sample, call_rate);

        if outcome.entered_recuperation {
            self.inner.sensor.record(
                SensorEvent::new(EventKind::Critical, "breathing")
                    .at("breathing")
                    .with_metadata(serde_json::json!({ "transition": "recuperation" })),
            );
        } else if outcome.left_recuperation {
            self.inner.sensor.record(
                SensorEvent::new(EventKind::System, "breathing")
                    .at("breathing")
                    .with_metadata(serde_json::json!({ "transition": "normal" })),
            );
        }

        let previous = self
            .inner
            .breathing_rate_ms
            .swap(outcome.next_rate_ms, Ordering::AcqRel);
        if previous != outcome.next_rate_ms {
            self.register_breathing(outcome.next_rate_ms);
        }
    }

    // ---- observability ------------------------------------------------

    /// Combined health snapshot
    pub fn get_system_health(&self) -> SystemHealth {
        SystemHealth {
            flags: self.inner.metrics.flags(),
            breathing: self.inner.metrics.breathing_state(),
            channel_count: self.inner.stores.channel_count(),
            handler_count: self.inner.stores.handler_count(),
            group_count: self.inner.groups.len(),
            formation_count: self.inner.timekeeper.formation_count(),
            retained_events: self.inner.sensor.len(),
            uptime_ms: self.inner.started_at.elapsed().as_millis() as u64,
        }
    }

    /// Breathing snapshot
    pub fn get_breathing_state(&self) -> BreathingState {
        self.inner.metrics.breathing_state()
    }

    /// Aggregate throughput counters
    pub fn get_performance_state(&self) -> PerformanceState {
        PerformanceState {
            total_calls: self.inner.sensor.total(EventKind::Call),
            total_dispatches: self.inner.sensor.total(EventKind::Dispatch),
            total_executions: self.inner.sensor.total(EventKind::Execution),
            total_errors: self.inner.sensor.total(EventKind::Error),
            calls_per_second: self.inner.sensor.calls_per_second(),
            scheduler: self.inner.timekeeper.stats(),
        }
    }

    /// Per-channel metrics, for one channel or all
    pub fn get_metrics(&self, channel_id: Option<&str>) -> Vec<ChannelMetrics> {
        let build = |channel: &Arc<Channel>| {
            let id = channel.config.id.clone();
            let counters = self.inner.sensor.channel_counters(&id).unwrap_or_default();
            ChannelMetrics {
                id,
                counters,
                execution_count: channel.stats.execution_count.load(Ordering::Relaxed),
                error_count: channel.stats.error_count.load(Ordering::Relaxed),
                last_duration_us: channel.stats.last_duration_us.load(Ordering::Relaxed),
                protection_types: channel
                    .protection_types
                    .iter()
                    .map(|t| t.to_string())
                    .collect(),
                created_at: channel.created_at,
            }
        };
        match channel_id {
            Some(id) => self
                .inner
                .stores
                .channel(id)
                .map(|channel| vec![build(&channel)])
                .unwrap_or_default(),
            None => self.inner.stores.channels().iter().map(build).collect(),
        }
    }

    /// Export recorded events, newest-first
    pub fn export_events(&self, filter: &EventFilter, limit: usize, offset: usize) -> Vec<SensorEvent> {
        self.inner.sensor.export(filter, limit, offset)
    }

    /// Live event stream; returns the subscription id
    pub fn create_stream(&self, filter: EventFilter, callback: SubscriberFn) -> String {
        self.inner.sensor.subscribe(filter, callback)
    }

    /// Cancel a live event stream
    pub fn remove_stream(&self, subscription_id: &str) -> bool {
        self.inner.sensor.unsubscribe(subscription_id)
    }

    /// Direct sensor handle
    pub fn sensor(&self) -> Arc<Sensor> {
        self.inner.sensor.clone()
    }

    /// Direct scheduler handle
    pub fn timekeeper(&self) -> TimeKeeper {
        self.inner.timekeeper.clone()
    }

    /// Fetch a channel record
    pub fn channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.inner.stores.channel(id)
    }
}

/// Combined health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub flags: SystemFlags,
    pub breathing: BreathingState,
    pub channel_count: usize,
    pub handler_count: usize,
    pub group_count: usize,
    pub formation_count: usize,
    pub retained_events: usize,
    pub uptime_ms: u64,
}

/// Aggregate throughput counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceState {
    pub total_calls: u64,
    pub total_dispatches: u64,
    pub total_executions: u64,
    pub total_errors: u64,
    pub calls_per_second: f64,
    pub scheduler: TimeKeeperStats,
}

/// Per-channel metrics report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub id: String,
    /// Sensor-side counters (calls, dispatches, errors, last call)
    pub counters: ChannelCounters,
    /// Successful executions recorded on the channel
    pub execution_count: u64,
    /// Failed executions recorded on the channel
    pub error_count: u64,
    /// Duration of the most recent execution, microseconds
    pub last_duration_us: u64,
    /// Compiled protection step tags
    pub protection_types: Vec<String>,
    /// Registration time
    pub created_at: DateTime<Utc>,
}
