//! Channel record: validated config plus compiled protection state
//!
//! Built once at registration by the pipeline compiler and treated as
//! immutable afterwards, so the call hot path can read it lock-free.
//! Mutable runtime state (counters, debounce bookkeeping) lives in
//! atomics and a small mutex beside the immutable parts.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

use crate::config::ChannelConfig;
use crate::pipeline::ProtectionStep;
use crate::types::{PriorityLevel, Repeat};

/// Runtime counters for one channel
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Successful handler executions
    pub execution_count: AtomicU64,
    /// Failed handler executions
    pub error_count: AtomicU64,
    /// Duration of the most recent execution, microseconds
    pub last_duration_us: AtomicU64,
    /// Monotonic time of the most recent execution (throttle anchor)
    pub last_execution: Mutex<Option<Instant>>,
}

impl ChannelStats {
    /// Record a successful execution
    pub fn record_execution(&self, at: Instant, duration_us: u64) {
        self.execution_count.fetch_add(1, Ordering::Relaxed);
        self.last_duration_us.store(duration_us, Ordering::Relaxed);
        *self.last_execution.lock() = Some(at);
    }

    /// Record a failed execution
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Time of the most recent execution
    pub fn last_execution(&self) -> Option<Instant> {
        *self.last_execution.lock()
    }
}

/// In-flight debounce bookkeeping
#[derive(Debug, Default)]
pub struct DebounceState {
    /// Id of the pending debounce formation, when one is scheduled
    pub timer_id: Option<String>,
    /// When the first coalesced call arrived (max-wait anchor)
    pub first_queued: Option<Instant>,
}

/// Scheduling directives extracted at compile time
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Spacing of executions after the first, milliseconds
    pub interval_ms: Option<u64>,
    /// First-execution delay, milliseconds
    pub delay_ms: Option<u64>,
    /// Total executions
    pub repeat: Repeat,
}

/// A registered channel with its compiled protection pipeline
pub struct Channel {
    /// The declarative configuration the channel was registered with
    pub config: ChannelConfig,
    /// Registration refused execution permanently (zero repeat, explicit block)
    pub is_blocked: bool,
    /// Why the channel is blocked
    pub block_reason: Option<String>,
    /// No protections at all: calls go straight to dispatch
    pub has_fast_path: bool,
    /// Change detection runs before dispatch, outside the pipeline
    pub has_change_detection: bool,
    /// At least one protection or change detection is configured
    pub has_protections: bool,
    /// Scheduling directives (delay/interval/repeat) are present
    pub has_scheduling: bool,
    /// Ordered protection steps, compiled as data
    pub pipeline: Vec<ProtectionStep>,
    /// Step tags parallel to `pipeline`, for metrics
    pub protection_types: Vec<&'static str>,
    /// Extracted scheduling directives
    pub schedule: Option<ScheduleConfig>,
    /// Runtime counters
    pub stats: ChannelStats,
    /// Debounce bookkeeping
    pub debounce: Mutex<DebounceState>,
    /// When the channel was registered
    pub created_at: DateTime<Utc>,
}

impl Channel {
    /// The channel's priority level (medium when unset)
    pub fn priority_level(&self) -> PriorityLevel {
        self.config
            .priority
            .as_ref()
            .map(|p| p.level)
            .unwrap_or_default()
    }

    /// Id of the channel's debounce formation
    pub fn debounce_timer_id(&self) -> String {
        format!("{}::debounce", self.config.id)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.config.id)
            .field("is_blocked", &self.is_blocked)
            .field("has_fast_path", &self.has_fast_path)
            .field("has_change_detection", &self.has_change_detection)
            .field("has_scheduling", &self.has_scheduling)
            .field("protection_types", &self.protection_types)
            .finish()
    }
}
