//! Breathing: system-wide health and adaptive rate control
//!
//! The quantum state of the bus. Stress is computed from cpu, memory,
//! event-loop lag, and call rate; the breathing rate adapts to stress;
//! recuperation blocks non-critical work while the system is overloaded.
//! Gate flags (`can_call`, `can_register`, `is_operational`) are
//! pre-computed on every state change to keep the call hot path
//! branch-light.
//!
//! Authority is split deliberately: recuperation is owned exclusively by
//! breathing, hibernation by the TimeKeeper, and lock/shutdown by
//! explicit operator calls.

mod probe;

pub use probe::{DefaultProbe, FixedProbe, StressSample, SystemProbe};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::constants::{
    BREATHING_RATE_BASE_MS, BREATHING_RATE_MAX_MS, BREATHING_RATE_MIN_MS,
    BREATHING_RATE_RECOVERY_MS, CALL_RATE_LIMIT, CPU_LIMIT, EVENT_LOOP_LAG_LIMIT_MS, MEMORY_LIMIT,
    STRESS_CRITICAL, STRESS_HIGH,
};

/// Per-dimension and combined stress, each in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StressComponents {
    pub cpu: f64,
    pub memory: f64,
    pub event_loop: f64,
    pub call_rate: f64,
    /// Weighted combination; a single spiking component dominates
    pub combined: f64,
}

/// Breathing pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreathingPattern {
    Normal,
    Recovery,
}

/// Snapshot of the breathing state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreathingState {
    /// Current stress components
    pub stress: StressComponents,
    /// Current breathing rate in milliseconds
    pub current_rate_ms: u64,
    /// Breathing pattern
    pub pattern: BreathingPattern,
    /// Whether the system is recuperating (non-critical work is shed)
    pub is_recuperating: bool,
    /// Consecutive recuperating breaths
    pub recuperation_depth: u32,
    /// Total breaths taken
    pub breath_count: u64,
    /// Timestamp of the last breath
    pub last_breath: DateTime<Utc>,
    /// When the next breath is due
    pub next_breath_due: DateTime<Utc>,
}

impl Default for BreathingState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            stress: StressComponents::default(),
            current_rate_ms: BREATHING_RATE_BASE_MS,
            pattern: BreathingPattern::Normal,
            is_recuperating: false,
            recuperation_depth: 0,
            breath_count: 0,
            last_breath: now,
            next_breath_due: now + chrono::Duration::milliseconds(BREATHING_RATE_BASE_MS as i64),
        }
    }
}

/// Pre-computed gate flags with human-readable reasons
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemFlags {
    /// Calls are admitted (recuperation does not flip this; it is applied
    /// per-channel in the pipeline so criticals still pass)
    pub can_call: bool,
    /// Registrations are admitted
    pub can_register: bool,
    /// Fully operational: callable, not recuperating, not hibernating, not locked
    pub is_operational: bool,
    /// Why any of the above are false
    pub reasons: Vec<String>,
}

impl Default for SystemFlags {
    fn default() -> Self {
        Self {
            can_call: true,
            can_register: true,
            is_operational: true,
            reasons: Vec::new(),
        }
    }
}

/// What a breathing tick changed
#[derive(Debug, Clone, Copy, Default)]
pub struct BreathOutcome {
    /// Rate to use for the next breath
    pub next_rate_ms: u64,
    /// The tick moved the system into recuperation
    pub entered_recuperation: bool,
    /// The tick moved the system back to normal
    pub left_recuperation: bool,
}

/// System-wide health state: breathing, stress, and gate flags
pub struct MetricsState {
    breathing: RwLock<BreathingState>,
    flags: RwLock<SystemFlags>,
    initialized: AtomicBool,
    locked: AtomicBool,
    shutdown: AtomicBool,
    hibernating: AtomicBool,
    recuperating: AtomicBool,
    /// Event-loop lag observed by the quartz engine, in milliseconds
    observed_lag_ms: AtomicU64,
    /// Last stress inputs and result, to skip recomputation on identical samples
    stress_memo: Mutex<Option<([u64; 4], StressComponents)>>,
}

impl MetricsState {
    /// New, initialized state with open gates
    pub fn new() -> Self {
        let state = Self {
            breathing: RwLock::new(BreathingState::default()),
            flags: RwLock::new(SystemFlags::default()),
            initialized: AtomicBool::new(true),
            locked: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            hibernating: AtomicBool::new(false),
            recuperating: AtomicBool::new(false),
            observed_lag_ms: AtomicU64::new(0),
            stress_memo: Mutex::new(None),
        };
        state.recompute_flags();
        state
    }

    /// Per-dimension stress: `min(1, x / (limit * 0.7))`, combined as
    /// `min(1, (sum + 2 * max) / 6)` so one spiking dimension dominates
    pub fn compute_stress(&self, sample: StressSample, call_rate: f64) -> StressComponents {
        let lag = sample
            .event_loop_lag_ms
            .max(self.observed_lag_ms.load(Ordering::Relaxed) as f64);

        let inputs = [
            sample.cpu.to_bits(),
            sample.memory.to_bits(),
            lag.to_bits(),
            call_rate.to_bits(),
        ];
        if let Some((memo_inputs, memo_result)) = *self.stress_memo.lock() {
            if memo_inputs == inputs {
                return memo_result;
            }
        }

        let dimension = |value: f64, limit: f64| (value / (limit * 0.7)).clamp(0.0, 1.0);
        let cpu = dimension(sample.cpu, CPU_LIMIT);
        let memory = dimension(sample.memory, MEMORY_LIMIT);
        let event_loop = dimension(lag, EVENT_LOOP_LAG_LIMIT_MS);
        let call_rate_stress = dimension(call_rate, CALL_RATE_LIMIT);

        let sum = cpu + memory + event_loop + call_rate_stress;
        let max = cpu.max(memory).max(event_loop).max(call_rate_stress);
        let combined = ((sum + 2.0 * max) / 6.0).min(1.0);

        let result = StressComponents {
            cpu,
            memory,
            event_loop,
            call_rate: call_rate_stress,
            combined,
        };
        *self.stress_memo.lock() = Some((inputs, result));
        result
    }

    /// Breathing rate for a combined stress level
    pub fn rate_for_stress(stress: f64) -> u64 {
        if stress >= STRESS_CRITICAL {
            return BREATHING_RATE_RECOVERY_MS;
        }
        let rate = BREATHING_RATE_BASE_MS as f64 * (1.0 + (stress.exp() - 1.0));
        (rate as u64).clamp(BREATHING_RATE_MIN_MS, BREATHING_RATE_MAX_MS)
    }

    /// Take one breath: recompute stress, rate, recuperation, and flags
    pub fn breathe(&self, sample: StressSample, call_rate: f64) -> BreathOutcome {
        let stress = self.compute_stress(sample, call_rate);
        let next_rate_ms = Self::rate_for_stress(stress.combined);
        let recuperating = stress.combined > STRESS_HIGH;
        let was_recuperating = self.recuperating.swap(recuperating, Ordering::AcqRel);

        {
            let mut breathing = self.breathing.write();
            let now = Utc::now();
            breathing.stress = stress;
            breathing.current_rate_ms = next_rate_ms;
            breathing.pattern = if recuperating {
                BreathingPattern::Recovery
            } else {
                BreathingPattern::Normal
            };
            breathing.is_recuperating = recuperating;
            breathing.recuperation_depth = if recuperating {
                breathing.recuperation_depth.saturating_add(1)
            } else {
                0
            };
            breathing.breath_count += 1;
            breathing.last_breath = now;
            breathing.next_breath_due = now + chrono::Duration::milliseconds(next_rate_ms as i64);
        }

        self.recompute_flags();

        let outcome = BreathOutcome {
            next_rate_ms,
            entered_recuperation: recuperating && !was_recuperating,
            left_recuperation: !recuperating && was_recuperating,
        };
        if outcome.entered_recuperation {
            tracing::warn!(
                combined = stress.combined,
                "entering recuperation, shedding non-critical work"
            );
        } else if outcome.left_recuperation {
            tracing::info!(combined = stress.combined, "recuperation over, resuming");
        }
        outcome
    }

    /// Recompute the pre-computed gate flags from current state
    pub fn recompute_flags(&self) {
        let initialized = self.initialized.load(Ordering::Acquire);
        let locked = self.locked.load(Ordering::Acquire);
        let shutdown = self.shutdown.load(Ordering::Acquire);
        let hibernating = self.hibernating.load(Ordering::Acquire);
        let recuperating = self.recuperating.load(Ordering::Acquire);

        let mut reasons = Vec::new();
        if !initialized {
            reasons.push("system is not initialized".to_string());
        }
        if shutdown {
            reasons.push("system is shut down".to_string());
        }
        if locked {
            reasons.push("system is locked".to_string());
        }
        if hibernating {
            reasons.push("system is hibernating".to_string());
        }
        if recuperating {
            reasons.push("system is recuperating".to_string());
        }

        let can_call = !shutdown && initialized;
        let can_register = !shutdown && !locked && initialized;
        let is_operational = can_call && !recuperating && !hibernating && !locked;

        *self.flags.write() = SystemFlags {
            can_call,
            can_register,
            is_operational,
            reasons,
        };
    }

    /// Current gate flags
    pub fn flags(&self) -> SystemFlags {
        self.flags.read().clone()
    }

    /// Snapshot of the breathing state
    pub fn breathing_state(&self) -> BreathingState {
        self.breathing.read().clone()
    }

    /// Current combined stress
    pub fn combined_stress(&self) -> f64 {
        self.breathing.read().stress.combined
    }

    /// Whether the system is recuperating
    pub fn is_recuperating(&self) -> bool {
        self.recuperating.load(Ordering::Acquire)
    }

    /// Whether the scheduler is hibernating
    pub fn is_hibernating(&self) -> bool {
        self.hibernating.load(Ordering::Acquire)
    }

    /// Hibernation flag; owned by the TimeKeeper
    pub fn set_hibernating(&self, hibernating: bool) {
        self.hibernating.store(hibernating, Ordering::Release);
        self.recompute_flags();
    }

    /// Record event-loop lag observed by the quartz engine
    pub fn observe_event_loop_lag(&self, lag_ms: u64) {
        self.observed_lag_ms.store(lag_ms, Ordering::Relaxed);
    }

    /// Operator: lock registrations
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
        self.recompute_flags();
    }

    /// Operator: unlock registrations
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
        self.recompute_flags();
    }

    /// Operator: shut the system down; gates stay closed until re-init
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.recompute_flags();
    }

    /// Whether the system has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Reset breathing to defaults; operator flags survive
    pub fn reset_breathing(&self) {
        *self.breathing.write() = BreathingState::default();
        self.recuperating.store(false, Ordering::Release);
        self.observed_lag_ms.store(0, Ordering::Relaxed);
        *self.stress_memo.lock() = None;
        self.recompute_flags();
    }
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}
