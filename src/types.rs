//! Core types shared across the bus
//!
//! Priority levels, repeat specifications, and the stored handler/hook
//! function shapes. Handlers are async and boxed; the lighter processing
//! hooks (schema, condition, selector, transform) are synchronous.

use crate::error::BusResult;
use futures::future::BoxFuture;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Channel priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    /// Always admitted, even during recuperation
    Critical,
    /// High priority
    High,
    /// Default priority
    Medium,
    /// Shed when combined stress exceeds the medium threshold
    Low,
    /// First to be shed under load
    Background,
}

impl Default for PriorityLevel {
    fn default() -> Self {
        PriorityLevel::Medium
    }
}

impl PriorityLevel {
    /// Whether this level is shed when stress exceeds the medium threshold
    pub fn sheddable(&self) -> bool {
        matches!(self, PriorityLevel::Low | PriorityLevel::Background)
    }
}

/// Priority configuration for a channel
///
/// Carries the execution policy knobs alongside the level: retry budget,
/// per-call timeout, backoff bounds, and an optional static fallback
/// payload returned once retries are exhausted.
#[derive(Clone, Default)]
pub struct PriorityConfig {
    /// Priority level
    pub level: PriorityLevel,
    /// Maximum handler retries after the initial attempt
    pub max_retries: u32,
    /// Per-call handler timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Static payload returned when the handler exhausts retries
    pub fallback: Option<Value>,
    /// Initial retry backoff delay in milliseconds
    pub base_delay_ms: Option<u64>,
    /// Retry backoff cap in milliseconds
    pub max_delay_ms: Option<u64>,
}

impl PriorityConfig {
    /// Priority config with just a level
    pub fn level(level: PriorityLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the per-call timeout
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Set the fallback payload
    pub fn with_fallback(mut self, payload: Value) -> Self {
        self.fallback = Some(payload);
        self
    }
}

impl std::fmt::Debug for PriorityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityConfig")
            .field("level", &self.level)
            .field("max_retries", &self.max_retries)
            .field("timeout_ms", &self.timeout_ms)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Repeat specification: a total execution count or forever
///
/// Serializes as the config surface expects: a number for a finite count,
/// `true` for forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Total number of executions; zero never runs
    Times(u64),
    /// Reschedule indefinitely
    Forever,
}

impl Repeat {
    /// Remaining executions after one firing, `None` when exhausted
    pub fn decrement(self) -> Option<Repeat> {
        match self {
            Repeat::Forever => Some(Repeat::Forever),
            Repeat::Times(0) | Repeat::Times(1) => None,
            Repeat::Times(n) => Some(Repeat::Times(n - 1)),
        }
    }

    /// Whether this spec permits at least one execution
    pub fn runnable(&self) -> bool {
        !matches!(self, Repeat::Times(0))
    }
}

impl Serialize for Repeat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Repeat::Times(n) => serializer.serialize_u64(*n),
            Repeat::Forever => serializer.serialize_bool(true),
        }
    }
}

impl<'de> Deserialize<'de> for Repeat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RepeatVisitor;

        impl<'de> Visitor<'de> for RepeatVisitor {
            type Value = Repeat;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a non-negative integer or `true`")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Repeat, E> {
                if v {
                    Ok(Repeat::Forever)
                } else {
                    Err(E::custom("repeat: false is not a valid specification"))
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Repeat, E> {
                Ok(Repeat::Times(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Repeat, E> {
                u64::try_from(v)
                    .map(Repeat::Times)
                    .map_err(|_| E::custom("repeat must be non-negative"))
            }
        }

        deserializer.deserialize_any(RepeatVisitor)
    }
}

/// Payload presence requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredPolicy {
    /// No requirement
    #[default]
    Off,
    /// Payload must not be null
    Required,
    /// Payload must be a non-empty string, array, or object
    NonEmpty,
}

/// What a handler hands back to the runtime
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Nothing of note
    Done,
    /// A result payload, returned to the caller
    Value(Value),
    /// An intra-link: call `id` with `payload` before the parent returns
    Link {
        /// Target channel id
        id: String,
        /// Payload for the chained call
        payload: Value,
    },
}

impl HandlerOutcome {
    /// The result payload, if any
    pub fn value(&self) -> Option<&Value> {
        match self {
            HandlerOutcome::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Boxed future returned by a registered handler
pub type HandlerFuture = BoxFuture<'static, BusResult<HandlerOutcome>>;

/// Stored handler: at most one per channel id
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Schema validator contract (the schema DSL itself lives outside the bus)
pub type SchemaValidator = Arc<dyn Fn(&Value) -> Result<(), Vec<String>> + Send + Sync>;

/// Predicate on the payload; `false` blocks the call
pub type ConditionFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Extracts a sub-value that replaces the payload
pub type SelectorFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Maps the payload to a new payload
pub type TransformFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
