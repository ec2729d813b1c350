//! In-process reactive action bus with adaptive breathing protection
//!
//! Producers invoke logical *channels* by id with a JSON payload; the
//! single registered handler per channel executes behind a compiled
//! *protection pipeline* (throttle, debounce, change detection, schema,
//! condition, selector, transform, priority shedding) and scheduling
//! directives (delay, interval, repeat). A breathing subsystem watches
//! load, adapts timer rates, sheds non-critical work during overload, and
//! reports health; a single quartz ticker drives every timer.
//!
//! ```rust,no_run
//! use pulsebus::{Bus, ChannelConfig, HandlerOutcome};
//! use serde_json::json;
//!
//! # async fn example() {
//! let bus = Bus::new();
//! bus.action(ChannelConfig::new("greeter").with_throttle(100));
//! bus.on("greeter", |payload| async move {
//!     println!("hello {payload}");
//!     Ok(HandlerOutcome::Done)
//! });
//! let response = bus.call("greeter", Some(json!({"name": "ada"}))).await;
//! assert!(response.ok);
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod breathing;
pub mod channel;
pub mod config;
pub mod constants;
pub mod error;
pub mod groups;
pub mod payload_state;
pub mod pipeline;
pub mod response;
pub mod runtime;
pub mod sensor;
pub mod stores;
pub mod timekeeper;
pub mod types;

pub use breathing::{
    BreathingPattern, BreathingState, DefaultProbe, FixedProbe, MetricsState, StressComponents,
    StressSample, SystemFlags, SystemProbe,
};
pub use channel::{Channel, ChannelStats, ScheduleConfig};
pub use config::ChannelConfig;
pub use error::{BusError, BusResult};
pub use groups::{AlertConfig, Group, GroupConfig, SharedConfig};
pub use payload_state::PayloadState;
pub use pipeline::{ProtectionStep, StepOutcome};
pub use response::{Response, ResponseMetadata};
pub use runtime::{Bus, BusBuilder, ChannelMetrics, PerformanceState, SystemHealth};
pub use sensor::{ChannelCounters, EventFilter, EventKind, Sensor, SensorEvent};
pub use timekeeper::{FormationStatus, PrecisionTier, TimeKeeper, TimeKeeperStats, TimerCallback};
pub use types::{
    Handler, HandlerFuture, HandlerOutcome, PriorityConfig, PriorityLevel, Repeat, RequiredPolicy,
};
