//! Bus constants
//!
//! Centralized constants for the action bus including breathing rate
//! bounds, stress thresholds, scheduler timing, and safety limits.

/// Minimum breathing rate in milliseconds
pub const BREATHING_RATE_MIN_MS: u64 = 50;

/// Base breathing rate in milliseconds (rate at zero stress)
pub const BREATHING_RATE_BASE_MS: u64 = 200;

/// Maximum breathing rate in milliseconds
pub const BREATHING_RATE_MAX_MS: u64 = 1000;

/// Recovery breathing rate in milliseconds (applied at critical stress)
pub const BREATHING_RATE_RECOVERY_MS: u64 = 2000;

/// Low stress threshold
pub const STRESS_LOW: f64 = 0.25;

/// Medium stress threshold (low/background priority channels are shed above this)
pub const STRESS_MEDIUM: f64 = 0.5;

/// High stress threshold (recuperation begins above this)
pub const STRESS_HIGH: f64 = 0.75;

/// Critical stress threshold (breathing switches to the recovery rate)
pub const STRESS_CRITICAL: f64 = 0.9;

/// CPU utilization limit used for stress normalization (fraction of one core)
pub const CPU_LIMIT: f64 = 0.8;

/// Memory utilization limit used for stress normalization (fraction of budget)
pub const MEMORY_LIMIT: f64 = 0.85;

/// Event-loop lag limit used for stress normalization (milliseconds)
pub const EVENT_LOOP_LAG_LIMIT_MS: f64 = 100.0;

/// Call-rate limit used for stress normalization (calls per second)
pub const CALL_RATE_LIMIT: f64 = 1000.0;

/// Quartz target tick interval in milliseconds
pub const QUARTZ_TICK_MS: u64 = 10;

/// Formations below this duration run in the high precision tier (milliseconds)
pub const HIGH_PRECISION_THRESHOLD_MS: u64 = 50;

/// Drift above this triggers interval compensation on high-tier formations (milliseconds)
pub const DRIFT_TOLERANCE_MS: u64 = 5;

/// Maximum single wait the quartz engine schedules directly; longer waits are chunked
pub const MAX_TIMEOUT_MS: u64 = 2_147_483_647;

/// Cumulative execution count above which a formation is force-removed
pub const RUNAWAY_EXECUTION_CAP: u64 = 50_000;

/// Maximum retained sensor events before oldest-first eviction
pub const SENSOR_RETENTION_MAX: usize = 10_000;

/// Fixed capacity of the live subscriber ring
pub const SENSOR_LIVE_RING_CAPACITY: usize = 256;

/// Moving call-rate window in milliseconds
pub const CALL_RATE_WINDOW_MS: u64 = 1_000;

/// Default retry backoff base delay in milliseconds
pub const RETRY_BASE_DELAY_MS: u64 = 100;

/// Default retry backoff cap in milliseconds
pub const RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Retry backoff multiplier
pub const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Ceiling for group offline-monitor cadence in milliseconds
pub const GROUP_MONITOR_MAX_INTERVAL_MS: u64 = 5_000;
