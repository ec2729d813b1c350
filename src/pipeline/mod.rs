//! Protection pipeline: compiler and interpreter
//!
//! A channel declaration compiles into an ordered list of tagged step
//! variants plus pre-computed fast-path and blocked flags. Interpreting
//! data in a small dispatcher keeps the order explicit in state and the
//! hot path free of nested closures. The fixed order is:
//! recuperation, zero-repeat guard, priority shed, throttle, debounce,
//! schema, required, condition, selector, transform. Change detection is
//! deliberately not a pipeline step: it runs before dispatch and records
//! only after a successful execution, so a blocked or failed call cannot
//! poison future comparisons.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::breathing::MetricsState;
use crate::channel::{Channel, ChannelStats, DebounceState, ScheduleConfig};
use crate::config::{payload_satisfies_required, validate_config, ChannelConfig};
use crate::constants::STRESS_MEDIUM;
use crate::error::BusResult;
use crate::types::{PriorityLevel, Repeat, RequiredPolicy};

/// One compiled protection step
#[derive(Clone)]
pub enum ProtectionStep {
    /// Block non-critical channels while the system recuperates
    Recuperation,
    /// Redundant guard for `repeat == 0`
    BlockZeroRepeat,
    /// Shed low/background channels above medium stress
    Priority,
    /// Minimum spacing between executions
    Throttle(u64),
    /// Collapse rapid calls; the runtime schedules the timer
    Debounce {
        ms: u64,
        max_wait: Option<u64>,
    },
    /// Payload validator
    Schema,
    /// Payload presence requirement
    Required,
    /// Payload predicate
    Condition,
    /// Payload replacement with a sub-value
    Selector,
    /// Payload mapping
    Transform,
}

impl ProtectionStep {
    /// Tag used for metrics and protection-type reporting
    pub fn tag(&self) -> &'static str {
        match self {
            ProtectionStep::Recuperation => "recuperation",
            ProtectionStep::BlockZeroRepeat => "block_zero_repeat",
            ProtectionStep::Priority => "priority",
            ProtectionStep::Throttle(_) => "throttle",
            ProtectionStep::Debounce { .. } => "debounce",
            ProtectionStep::Schema => "schema",
            ProtectionStep::Required => "required",
            ProtectionStep::Condition => "condition",
            ProtectionStep::Selector => "selector",
            ProtectionStep::Transform => "transform",
        }
    }
}

impl std::fmt::Debug for ProtectionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtectionStep::Throttle(ms) => write!(f, "Throttle({ms}ms)"),
            ProtectionStep::Debounce { ms, max_wait } => {
                write!(f, "Debounce({ms}ms, max_wait={max_wait:?})")
            }
            other => f.write_str(other.tag()),
        }
    }
}

/// Outcome of interpreting one step
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Proceed with the current payload
    Continue,
    /// Proceed with a replacement payload
    ContinueWith(Value),
    /// Deny the call
    Block(String),
    /// Debounce: the runtime schedules the deferred execution
    Delayed {
        /// Quiet period in milliseconds
        duration_ms: u64,
    },
}

/// Compile a channel declaration into a [`Channel`] record
///
/// Validates the configuration, computes the blocked/fast-path flags, and
/// assembles the ordered step list. Steps the channel does not need are
/// omitted.
pub fn compile(config: ChannelConfig) -> BusResult<Channel> {
    validate_config(&config)?;

    let (is_blocked, block_reason) = if config.block {
        (true, Some("blocked by configuration".to_string()))
    } else if config.repeat == Some(Repeat::Times(0)) {
        (true, Some("repeat is 0".to_string()))
    } else {
        (false, None)
    };

    let priority_level = config
        .priority
        .as_ref()
        .map(|p| p.level)
        .unwrap_or_default();

    let needs_pipeline = config.throttle.map_or(false, |t| t > 0)
        || config.debounce.map_or(false, |d| d > 0)
        || config.schema.is_some()
        || config.condition.is_some()
        || config.selector.is_some()
        || config.transform.is_some()
        || config.required != RequiredPolicy::Off
        || priority_level != PriorityLevel::Medium
        || !config.middleware.is_empty();

    let mut pipeline = Vec::new();
    if needs_pipeline {
        pipeline.push(ProtectionStep::Recuperation);
        if config.repeat == Some(Repeat::Times(0)) {
            pipeline.push(ProtectionStep::BlockZeroRepeat);
        }
        if priority_level.sheddable() {
            pipeline.push(ProtectionStep::Priority);
        }
        if let Some(throttle) = config.throttle.filter(|t| *t > 0) {
            pipeline.push(ProtectionStep::Throttle(throttle));
        }
        if let Some(debounce) = config.debounce.filter(|d| *d > 0) {
            pipeline.push(ProtectionStep::Debounce {
                ms: debounce,
                max_wait: config.max_wait,
            });
        }
        if config.schema.is_some() {
            pipeline.push(ProtectionStep::Schema);
        }
        if config.required != RequiredPolicy::Off {
            pipeline.push(ProtectionStep::Required);
        }
        if config.condition.is_some() {
            pipeline.push(ProtectionStep::Condition);
        }
        if config.selector.is_some() {
            pipeline.push(ProtectionStep::Selector);
        }
        if config.transform.is_some() {
            pipeline.push(ProtectionStep::Transform);
        }
    }

    let protection_types: Vec<&'static str> = pipeline.iter().map(|s| s.tag()).collect();
    let has_change_detection = config.detect_changes;
    let has_fast_path = pipeline.is_empty() && !has_change_detection;
    let has_protections = !pipeline.is_empty() || has_change_detection;

    let has_scheduling =
        config.interval.is_some() || config.delay.is_some() || config.repeat.is_some();
    let schedule = if has_scheduling {
        Some(ScheduleConfig {
            interval_ms: config.interval,
            delay_ms: config.delay,
            repeat: config.repeat.unwrap_or(Repeat::Times(1)),
        })
    } else {
        None
    };

    Ok(Channel {
        config,
        is_blocked,
        block_reason,
        has_fast_path,
        has_change_detection,
        has_protections,
        has_scheduling,
        pipeline,
        protection_types,
        schedule,
        stats: ChannelStats::default(),
        debounce: Mutex::new(DebounceState::default()),
        created_at: Utc::now(),
    })
}

/// Interpret one step against the current payload
pub fn run_step(
    step: &ProtectionStep,
    channel: &Channel,
    payload: &Value,
    metrics: &MetricsState,
) -> StepOutcome {
    match step {
        ProtectionStep::Recuperation => {
            if metrics.is_recuperating() && channel.priority_level() != PriorityLevel::Critical {
                StepOutcome::Block(
                    "System recuperating - only critical channels accepted".to_string(),
                )
            } else {
                StepOutcome::Continue
            }
        }
        ProtectionStep::BlockZeroRepeat => StepOutcome::Block("repeat is 0".to_string()),
        ProtectionStep::Priority => {
            if metrics.combined_stress() > STRESS_MEDIUM && channel.priority_level().sheddable() {
                StepOutcome::Block(format!(
                    "Priority {:?} shed under stress",
                    channel.priority_level()
                ))
            } else {
                StepOutcome::Continue
            }
        }
        ProtectionStep::Throttle(ms) => match channel.stats.last_execution() {
            None => StepOutcome::Continue,
            Some(last) => {
                let elapsed_ms = Instant::now().duration_since(last).as_millis() as u64;
                if elapsed_ms < *ms {
                    StepOutcome::Block(format!("Throttled: {}ms remaining", ms - elapsed_ms))
                } else {
                    StepOutcome::Continue
                }
            }
        },
        ProtectionStep::Debounce { ms, .. } => StepOutcome::Delayed { duration_ms: *ms },
        ProtectionStep::Schema => match &channel.config.schema {
            Some(validator) => match validator(payload) {
                Ok(()) => StepOutcome::Continue,
                Err(errors) => {
                    StepOutcome::Block(format!("Schema validation failed: {}", errors.join(", ")))
                }
            },
            None => StepOutcome::Continue,
        },
        ProtectionStep::Required => {
            if payload_satisfies_required(channel.config.required, payload) {
                StepOutcome::Continue
            } else {
                StepOutcome::Block("Required payload missing or empty".to_string())
            }
        }
        ProtectionStep::Condition => match &channel.config.condition {
            Some(condition) if !condition(payload) => {
                StepOutcome::Block("Condition not met".to_string())
            }
            _ => StepOutcome::Continue,
        },
        ProtectionStep::Selector => match &channel.config.selector {
            Some(selector) => StepOutcome::ContinueWith(selector(payload)),
            None => StepOutcome::Continue,
        },
        ProtectionStep::Transform => match &channel.config.transform {
            Some(transform) => StepOutcome::ContinueWith(transform(payload)),
            None => StepOutcome::Continue,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriorityConfig;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn bare_channel_gets_fast_path() {
        let channel = compile(ChannelConfig::new("plain")).unwrap();
        assert!(channel.has_fast_path);
        assert!(!channel.has_protections);
        assert!(channel.pipeline.is_empty());
        assert!(!channel.is_blocked);
    }

    #[test]
    fn zero_repeat_blocks_with_reason() {
        let channel = compile(
            ChannelConfig::new("never")
                .with_interval(100)
                .with_repeat(Repeat::Times(0)),
        )
        .unwrap();
        assert!(channel.is_blocked);
        assert_eq!(channel.block_reason.as_deref(), Some("repeat is 0"));
    }

    #[test]
    fn pipeline_preserves_fixed_order() {
        let channel = compile(
            ChannelConfig::new("ordered")
                .with_throttle(100)
                .with_priority(PriorityConfig::level(PriorityLevel::Low))
                .with_transform(Arc::new(|p| p.clone()))
                .with_condition(Arc::new(|_| true))
                .with_schema(Arc::new(|_| Ok(()))),
        )
        .unwrap();
        assert_eq!(
            channel.protection_types,
            vec![
                "recuperation",
                "priority",
                "throttle",
                "schema",
                "condition",
                "transform"
            ]
        );
        assert!(!channel.has_fast_path);
    }

    #[test]
    fn change_detection_is_not_a_pipeline_step() {
        let channel = compile(ChannelConfig::new("cd").with_change_detection()).unwrap();
        assert!(channel.has_change_detection);
        assert!(channel.has_protections);
        assert!(!channel.has_fast_path);
        assert!(channel.pipeline.is_empty());
    }

    #[test]
    fn scheduling_flags_extracted() {
        let channel = compile(
            ChannelConfig::new("sched")
                .with_interval(100)
                .with_repeat(Repeat::Times(3)),
        )
        .unwrap();
        assert!(channel.has_scheduling);
        let schedule = channel.schedule.unwrap();
        assert_eq!(schedule.interval_ms, Some(100));
        assert_eq!(schedule.repeat, Repeat::Times(3));
        // Scheduling alone is not a protection.
        assert!(channel.has_fast_path);
    }

    #[test]
    fn schema_step_blocks_with_joined_errors() {
        let channel = compile(ChannelConfig::new("strict").with_schema(Arc::new(|v| {
            if v.get("name").is_some() {
                Ok(())
            } else {
                Err(vec!["name is required".to_string(), "see docs".to_string()])
            }
        })))
        .unwrap();
        let metrics = MetricsState::new();

        let outcome = run_step(
            &ProtectionStep::Schema,
            &channel,
            &json!({"other": 1}),
            &metrics,
        );
        match outcome {
            StepOutcome::Block(reason) => {
                assert!(reason.contains("name is required"));
                assert!(reason.contains("see docs"));
            }
            other => panic!("expected block, got {other:?}"),
        }

        let outcome = run_step(
            &ProtectionStep::Schema,
            &channel,
            &json!({"name": "x"}),
            &metrics,
        );
        assert!(matches!(outcome, StepOutcome::Continue));
    }

    #[test]
    fn selector_replaces_payload() {
        let channel = compile(
            ChannelConfig::new("sel")
                .with_selector(Arc::new(|v| v.get("inner").cloned().unwrap_or(Value::Null))),
        )
        .unwrap();
        let metrics = MetricsState::new();
        let outcome = run_step(
            &ProtectionStep::Selector,
            &channel,
            &json!({"inner": {"x": 1}}),
            &metrics,
        );
        match outcome {
            StepOutcome::ContinueWith(p) => assert_eq!(p, json!({"x": 1})),
            other => panic!("expected replacement, got {other:?}"),
        }
    }

    #[test]
    fn condition_false_blocks() {
        let channel = compile(
            ChannelConfig::new("cond")
                .with_condition(Arc::new(|v| v.get("go").and_then(Value::as_bool) == Some(true))),
        )
        .unwrap();
        let metrics = MetricsState::new();
        assert!(matches!(
            run_step(
                &ProtectionStep::Condition,
                &channel,
                &json!({"go": false}),
                &metrics
            ),
            StepOutcome::Block(_)
        ));
        assert!(matches!(
            run_step(
                &ProtectionStep::Condition,
                &channel,
                &json!({"go": true}),
                &metrics
            ),
            StepOutcome::Continue
        ));
    }
}
