//! Channel groups: pattern-matched sets sharing configuration
//!
//! A group selects channels by glob patterns (`*` any sequence, `?` any
//! single character, `/…/` for raw regex, plain equality otherwise) and
//! applies its shared configuration on creation and to every late-joining
//! channel. Removal stops future auto-joins but does not unapply merges
//! already made. Groups may also carry an offline-alert policy, monitored
//! by a TimeKeeper formation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ChannelConfig;
use crate::constants::GROUP_MONITOR_MAX_INTERVAL_MS;
use crate::error::{BusError, BusResult};
use crate::types::{
    ConditionFn, PriorityConfig, Repeat, RequiredPolicy, SchemaValidator, SelectorFn, TransformFn,
};

/// Invoked when a member channel goes offline; receives the channel id
pub type AlertHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Offline-alert policy for a group
#[derive(Clone)]
pub struct AlertConfig {
    /// A member with no call for this long is considered offline
    pub offline_threshold_ms: u64,
    /// Optional callback invoked alongside the sensor event
    pub handler: Option<AlertHandler>,
}

impl AlertConfig {
    /// Alert policy with just a threshold
    pub fn offline_after(threshold_ms: u64) -> Self {
        Self {
            offline_threshold_ms: threshold_ms,
            handler: None,
        }
    }

    /// Attach an alert handler
    pub fn with_handler(mut self, handler: AlertHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Cadence of the monitoring formation
    pub fn monitor_interval_ms(&self) -> u64 {
        (self.offline_threshold_ms / 2).min(GROUP_MONITOR_MAX_INTERVAL_MS).max(1)
    }
}

impl std::fmt::Debug for AlertConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertConfig")
            .field("offline_threshold_ms", &self.offline_threshold_ms)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Partial channel configuration shared by a group's members
///
/// Applied by deep merge: a set field wins over the member's own value,
/// the channel id is always preserved, and `middleware`/`tags` are
/// concatenated rather than replaced.
#[derive(Clone, Default)]
pub struct SharedConfig {
    pub throttle: Option<u64>,
    pub debounce: Option<u64>,
    pub max_wait: Option<u64>,
    pub detect_changes: Option<bool>,
    pub delay: Option<u64>,
    pub interval: Option<u64>,
    pub repeat: Option<Repeat>,
    pub schema: Option<SchemaValidator>,
    pub condition: Option<ConditionFn>,
    pub selector: Option<SelectorFn>,
    pub transform: Option<TransformFn>,
    pub required: Option<RequiredPolicy>,
    pub priority: Option<PriorityConfig>,
    pub middleware: Vec<String>,
    pub tags: Vec<String>,
}

impl SharedConfig {
    /// Merge this shared config into a member's configuration
    pub fn apply(&self, mut config: ChannelConfig) -> ChannelConfig {
        if let Some(throttle) = self.throttle {
            config.throttle = Some(throttle);
        }
        if let Some(debounce) = self.debounce {
            config.debounce = Some(debounce);
        }
        if let Some(max_wait) = self.max_wait {
            config.max_wait = Some(max_wait);
        }
        if let Some(detect_changes) = self.detect_changes {
            config.detect_changes = detect_changes;
        }
        if let Some(delay) = self.delay {
            config.delay = Some(delay);
        }
        if let Some(interval) = self.interval {
            config.interval = Some(interval);
        }
        if let Some(repeat) = self.repeat {
            config.repeat = Some(repeat);
        }
        if let Some(schema) = &self.schema {
            config.schema = Some(schema.clone());
        }
        if let Some(condition) = &self.condition {
            config.condition = Some(condition.clone());
        }
        if let Some(selector) = &self.selector {
            config.selector = Some(selector.clone());
        }
        if let Some(transform) = &self.transform {
            config.transform = Some(transform.clone());
        }
        if let Some(required) = self.required {
            config.required = required;
        }
        if let Some(priority) = &self.priority {
            config.priority = Some(priority.clone());
        }
        for tag in &self.middleware {
            if !config.middleware.contains(tag) {
                config.middleware.push(tag.clone());
            }
        }
        for tag in &self.tags {
            if !config.tags.contains(tag) {
                config.tags.push(tag.clone());
            }
        }
        config
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig")
            .field("throttle", &self.throttle)
            .field("debounce", &self.debounce)
            .field("detect_changes", &self.detect_changes)
            .field("priority", &self.priority)
            .field("middleware", &self.middleware)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Declarative group description
#[derive(Clone, Debug, Default)]
pub struct GroupConfig {
    /// Member-selection patterns
    pub patterns: Vec<String>,
    /// Configuration applied to every member
    pub shared: SharedConfig,
    /// Optional offline-alert policy
    pub alerts: Option<AlertConfig>,
}

impl GroupConfig {
    /// Group selecting channels by the given patterns
    pub fn matching<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the shared configuration
    pub fn with_shared(mut self, shared: SharedConfig) -> Self {
        self.shared = shared;
        self
    }

    /// Set the alert policy
    pub fn with_alerts(mut self, alerts: AlertConfig) -> Self {
        self.alerts = Some(alerts);
        self
    }
}

/// Compile one pattern into a matcher
///
/// `/…/` is raw regex; otherwise `*` and `?` glob metacharacters are
/// translated and everything else matches literally.
pub fn compile_pattern(pattern: &str) -> BusResult<Regex> {
    let source = if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        pattern[1..pattern.len() - 1].to_string()
    } else {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(&other.to_string())),
            }
        }
        source.push('$');
        source
    };
    Regex::new(&source)
        .map_err(|e| BusError::Registration(format!("invalid group pattern {pattern:?}: {e}")))
}

/// A registered group
pub struct Group {
    /// Group id
    pub id: String,
    /// Source patterns
    pub patterns: Vec<String>,
    matchers: Vec<Regex>,
    /// Shared member configuration
    pub shared: SharedConfig,
    /// Optional alert policy
    pub alerts: Option<AlertConfig>,
    /// Current members
    matched: Mutex<HashSet<String>>,
    /// Inactive groups stop auto-joining new channels
    is_active: AtomicBool,
    /// Channels currently in the alerted state
    pub alert_states: DashMap<String, bool>,
    /// When the group was created
    pub created_at: DateTime<Utc>,
}

impl Group {
    /// Build a group from its config
    pub fn new(id: impl Into<String>, config: GroupConfig) -> BusResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(BusError::Registration(
                "group id must be a non-empty string".to_string(),
            ));
        }
        if config.patterns.is_empty() {
            return Err(BusError::Registration(
                "group requires at least one pattern".to_string(),
            ));
        }
        let matchers = config
            .patterns
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<BusResult<Vec<_>>>()?;
        Ok(Self {
            id,
            patterns: config.patterns,
            matchers,
            shared: config.shared,
            alerts: config.alerts,
            matched: Mutex::new(HashSet::new()),
            is_active: AtomicBool::new(true),
            alert_states: DashMap::new(),
            created_at: Utc::now(),
        })
    }

    /// Whether a channel id matches any of the group's patterns
    pub fn matches(&self, channel_id: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(channel_id))
    }

    /// Record a member
    pub fn add_member(&self, channel_id: &str) -> bool {
        self.matched.lock().insert(channel_id.to_string())
    }

    /// Drop a member and any alert state
    pub fn remove_member(&self, channel_id: &str) -> bool {
        self.alert_states.remove(channel_id);
        self.matched.lock().remove(channel_id)
    }

    /// Snapshot of member ids
    pub fn members(&self) -> Vec<String> {
        self.matched.lock().iter().cloned().collect()
    }

    /// Whether the group still auto-joins channels
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Deactivate the group (stops future auto-joins)
    pub fn deactivate(&self) {
        self.is_active.store(false, Ordering::Release);
    }

    /// Id of the group's monitoring formation
    pub fn monitor_timer_id(&self) -> String {
        format!("group::{}::monitor", self.id)
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("patterns", &self.patterns)
            .field("members", &self.matched.lock().len())
            .field("is_active", &self.is_active())
            .finish()
    }
}

/// Id-keyed group store
#[derive(Default)]
pub struct GroupStore {
    groups: DashMap<String, Arc<Group>>,
}

impl GroupStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a group
    pub fn insert(&self, group: Arc<Group>) -> Option<Arc<Group>> {
        self.groups.insert(group.id.clone(), group)
    }

    /// Fetch a group
    pub fn get(&self, id: &str) -> Option<Arc<Group>> {
        self.groups.get(id).map(|g| g.value().clone())
    }

    /// Remove a group, deactivating it
    pub fn remove(&self, id: &str) -> Option<Arc<Group>> {
        self.groups.remove(id).map(|(_, group)| {
            group.deactivate();
            group
        })
    }

    /// Snapshot of all groups
    pub fn all(&self) -> Vec<Arc<Group>> {
        self.groups.iter().map(|g| g.value().clone()).collect()
    }

    /// Active groups whose patterns match a channel id
    pub fn matching(&self, channel_id: &str) -> Vec<Arc<Group>> {
        self.groups
            .iter()
            .filter(|g| g.value().is_active() && g.value().matches(channel_id))
            .map(|g| g.value().clone())
            .collect()
    }

    /// Number of groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
