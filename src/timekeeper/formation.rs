//! Formation: one scheduled timer entry inside the TimeKeeper

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

use crate::constants::{HIGH_PRECISION_THRESHOLD_MS, MAX_TIMEOUT_MS};
use crate::error::BusResult;
use crate::types::Repeat;

/// Callback fired when a formation comes due
pub type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, BusResult<()>> + Send + Sync>;

/// Formation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormationStatus {
    /// Eligible to fire when due
    Active,
    /// Held; `resume` reschedules from now
    Paused,
}

/// Precision tier, decided by the formation's duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrecisionTier {
    /// Short intervals; fired first on each tick, drift-compensated
    High,
    /// Everything below the platform wait cap
    Standard,
    /// Waits beyond the cap, served in successive chunks
    Chunked,
}

impl PrecisionTier {
    /// Tier for a given duration
    pub fn for_duration(duration_ms: u64) -> Self {
        if duration_ms < HIGH_PRECISION_THRESHOLD_MS {
            PrecisionTier::High
        } else if duration_ms < MAX_TIMEOUT_MS {
            PrecisionTier::Standard
        } else {
            PrecisionTier::Chunked
        }
    }
}

/// Execution bookkeeping carried by every formation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FormationMetrics {
    /// Completed executions
    pub executions: u64,
    /// Executions whose callback returned an error
    pub failed_executions: u64,
    /// Total callback time in microseconds
    pub total_execution_us: u64,
    /// Drift of the most recent firing, milliseconds (positive = late)
    pub last_drift_ms: i64,
}

/// A scheduled timer entry
///
/// One formation per id; re-adding with the same id replaces the entry
/// after releasing the previous one. `generation` guards against a stale
/// quartz firing touching a replacement that reused the id.
pub struct Formation {
    /// Formation id
    pub id: String,
    /// Replacement counter; bumped whenever the id is re-registered
    pub generation: u64,
    /// When the formation was registered
    pub start_time: Instant,
    /// Base wait for subsequent executions, milliseconds
    pub duration_ms: u64,
    /// Duration as originally requested, before drift compensation
    pub original_duration_ms: u64,
    /// First-execution delay, when one was requested
    pub delay_ms: Option<u64>,
    /// Interval for executions after the first, when one was requested
    pub interval_ms: Option<u64>,
    /// Remaining executions
    pub repeat: Repeat,
    /// Fired callback
    pub callback: TimerCallback,
    /// When the formation next comes due
    pub next_execution: Instant,
    /// When the formation last fired
    pub last_execution: Option<Instant>,
    /// Whether the first execution has happened
    pub has_executed_once: bool,
    /// Lifecycle status
    pub status: FormationStatus,
    /// Precision tier
    pub tier: PrecisionTier,
    /// Waiting through chunks of a wait longer than the platform cap
    pub in_recuperation: bool,
    /// Wait still owed after the current chunk, milliseconds
    pub chunk_remaining_ms: u64,
    /// Execution bookkeeping
    pub metrics: FormationMetrics,
}

impl Formation {
    /// Whether the formation is eligible to fire at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        self.status == FormationStatus::Active && self.next_execution <= now
    }

    /// Point the formation at a wait of `wait_ms` from `now`, chunking
    /// waits beyond the platform cap
    pub fn schedule_wait(&mut self, wait_ms: u64, now: Instant) {
        if wait_ms > MAX_TIMEOUT_MS {
            self.in_recuperation = true;
            self.chunk_remaining_ms = wait_ms - MAX_TIMEOUT_MS;
            self.next_execution = now + std::time::Duration::from_millis(MAX_TIMEOUT_MS);
        } else {
            self.in_recuperation = false;
            self.chunk_remaining_ms = 0;
            self.next_execution = now + std::time::Duration::from_millis(wait_ms);
        }
    }
}

impl std::fmt::Debug for Formation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Formation")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("duration_ms", &self.duration_ms)
            .field("delay_ms", &self.delay_ms)
            .field("interval_ms", &self.interval_ms)
            .field("repeat", &self.repeat)
            .field("status", &self.status)
            .field("tier", &self.tier)
            .field("in_recuperation", &self.in_recuperation)
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries() {
        assert_eq!(PrecisionTier::for_duration(0), PrecisionTier::High);
        assert_eq!(PrecisionTier::for_duration(49), PrecisionTier::High);
        assert_eq!(PrecisionTier::for_duration(50), PrecisionTier::Standard);
        assert_eq!(
            PrecisionTier::for_duration(MAX_TIMEOUT_MS),
            PrecisionTier::Chunked
        );
    }

    #[test]
    fn long_waits_are_chunked() {
        let now = Instant::now();
        let mut formation = Formation {
            id: "f".into(),
            generation: 0,
            start_time: now,
            duration_ms: MAX_TIMEOUT_MS + 500,
            original_duration_ms: MAX_TIMEOUT_MS + 500,
            delay_ms: None,
            interval_ms: None,
            repeat: Repeat::Times(1),
            callback: Arc::new(|| Box::pin(async { Ok(()) })),
            next_execution: now,
            last_execution: None,
            has_executed_once: false,
            status: FormationStatus::Active,
            tier: PrecisionTier::Chunked,
            in_recuperation: false,
            chunk_remaining_ms: 0,
            metrics: FormationMetrics::default(),
        };

        formation.schedule_wait(MAX_TIMEOUT_MS + 500, now);
        assert!(formation.in_recuperation);
        assert_eq!(formation.chunk_remaining_ms, 500);

        let later = formation.next_execution;
        formation.schedule_wait(formation.chunk_remaining_ms, later);
        assert!(!formation.in_recuperation);
        assert_eq!(formation.chunk_remaining_ms, 0);
    }
}
