//! Channel configuration and validation
//!
//! A [`ChannelConfig`] is the declarative description of a channel. It is
//! validated at registration; the pipeline compiler then turns it into a
//! fixed protection pipeline plus pre-computed fast-path flags.

use serde_json::Value;

use crate::error::{BusError, BusResult};
use crate::types::{
    ConditionFn, PriorityConfig, Repeat, RequiredPolicy, SchemaValidator, SelectorFn, TransformFn,
};

/// Declarative channel description, keyed by `id`
#[derive(Clone, Default)]
pub struct ChannelConfig {
    /// Channel identifier (required, non-empty, immutable for the channel's lifetime)
    pub id: String,
    /// Minimum spacing between executions in milliseconds
    pub throttle: Option<u64>,
    /// Collapse rapid calls; the last payload wins after this quiet period
    pub debounce: Option<u64>,
    /// Cap on total debounce collapse time; requires `debounce` and must exceed it
    pub max_wait: Option<u64>,
    /// Skip execution when the payload deep-equals the last accepted one
    pub detect_changes: bool,
    /// First-execution delay in milliseconds
    pub delay: Option<u64>,
    /// Spacing of subsequent executions in milliseconds; requires `repeat`
    pub interval: Option<u64>,
    /// Total execution count, or forever
    pub repeat: Option<Repeat>,
    /// Payload validator (contract only; the schema DSL lives outside the bus)
    pub schema: Option<SchemaValidator>,
    /// Predicate on the payload; `false` blocks the call
    pub condition: Option<ConditionFn>,
    /// Replaces the payload with a sub-value before dispatch
    pub selector: Option<SelectorFn>,
    /// Maps the payload before dispatch
    pub transform: Option<TransformFn>,
    /// Payload presence requirement
    pub required: RequiredPolicy,
    /// Priority and execution policy
    pub priority: Option<PriorityConfig>,
    /// Middleware tags (interpreted by external orchestration helpers)
    pub middleware: Vec<String>,
    /// Group membership hint
    pub group: Option<String>,
    /// Free-form tags
    pub tags: Vec<String>,
    /// Emit verbose logs for this channel
    pub log: bool,
    /// Register the channel pre-blocked
    pub block: bool,
}

impl ChannelConfig {
    /// New config with just an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set the throttle window
    pub fn with_throttle(mut self, ms: u64) -> Self {
        self.throttle = Some(ms);
        self
    }

    /// Set the debounce window
    pub fn with_debounce(mut self, ms: u64) -> Self {
        self.debounce = Some(ms);
        self
    }

    /// Cap total debounce collapse time
    pub fn with_max_wait(mut self, ms: u64) -> Self {
        self.max_wait = Some(ms);
        self
    }

    /// Enable change detection
    pub fn with_change_detection(mut self) -> Self {
        self.detect_changes = true;
        self
    }

    /// Set the first-execution delay
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay = Some(ms);
        self
    }

    /// Set the execution interval
    pub fn with_interval(mut self, ms: u64) -> Self {
        self.interval = Some(ms);
        self
    }

    /// Set the repeat specification
    pub fn with_repeat(mut self, repeat: Repeat) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// Set the schema validator
    pub fn with_schema(mut self, schema: SchemaValidator) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Set the condition predicate
    pub fn with_condition(mut self, condition: ConditionFn) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Set the payload selector
    pub fn with_selector(mut self, selector: SelectorFn) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Set the payload transform
    pub fn with_transform(mut self, transform: TransformFn) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Set the payload requirement
    pub fn with_required(mut self, required: RequiredPolicy) -> Self {
        self.required = required;
        self
    }

    /// Set the priority config
    pub fn with_priority(mut self, priority: PriorityConfig) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Assign the channel to a group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Append a middleware tag
    pub fn with_middleware(mut self, tag: impl Into<String>) -> Self {
        self.middleware.push(tag.into());
        self
    }

    /// Append a free-form tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Emit verbose logs for this channel's executions
    pub fn with_log(mut self) -> Self {
        self.log = true;
        self
    }

    /// Register the channel pre-blocked
    pub fn blocked(mut self) -> Self {
        self.block = true;
        self
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("id", &self.id)
            .field("throttle", &self.throttle)
            .field("debounce", &self.debounce)
            .field("max_wait", &self.max_wait)
            .field("detect_changes", &self.detect_changes)
            .field("delay", &self.delay)
            .field("interval", &self.interval)
            .field("repeat", &self.repeat)
            .field("required", &self.required)
            .field("priority", &self.priority)
            .field("group", &self.group)
            .field("has_schema", &self.schema.is_some())
            .field("has_condition", &self.condition.is_some())
            .field("has_selector", &self.selector.is_some())
            .field("has_transform", &self.transform.is_some())
            .finish()
    }
}

/// Validate a channel configuration, collecting every violation
///
/// Enforced rules:
/// - `id` must be non-empty
/// - `throttle` and `debounce` cannot both be set
/// - `interval` requires `repeat`
/// - `max_wait` requires `debounce` and must exceed it
pub fn validate_config(config: &ChannelConfig) -> BusResult<()> {
    let mut errors: Vec<String> = Vec::new();

    if config.id.trim().is_empty() {
        errors.push("id must be a non-empty string".to_string());
    }

    if matches!(config.throttle, Some(t) if t > 0) && matches!(config.debounce, Some(d) if d > 0) {
        errors.push("throttle and debounce cannot both be set".to_string());
    }

    if config.interval.is_some() && config.repeat.is_none() {
        errors.push("interval requires repeat".to_string());
    }

    match (config.max_wait, config.debounce) {
        (Some(_), None) => errors.push("maxWait requires debounce".to_string()),
        (Some(w), Some(d)) if w <= d => {
            errors.push(format!("maxWait ({w}ms) must exceed debounce ({d}ms)"));
        }
        _ => {}
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(BusError::Registration(errors.join("; ")))
    }
}

/// Whether a payload satisfies the `required` policy
pub fn payload_satisfies_required(policy: RequiredPolicy, payload: &Value) -> bool {
    match policy {
        RequiredPolicy::Off => true,
        RequiredPolicy::Required => !payload.is_null(),
        RequiredPolicy::NonEmpty => match payload {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            _ => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_id_is_rejected() {
        let err = validate_config(&ChannelConfig::new("")).unwrap_err();
        assert!(err.to_string().contains("non-empty"));
    }

    #[test]
    fn throttle_and_debounce_are_mutually_exclusive() {
        let config = ChannelConfig::new("ch").with_throttle(100).with_debounce(50);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn interval_requires_repeat() {
        let config = ChannelConfig::new("ch").with_interval(100);
        assert!(validate_config(&config).is_err());
        let config = ChannelConfig::new("ch")
            .with_interval(100)
            .with_repeat(Repeat::Times(3));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn max_wait_must_exceed_debounce() {
        let config = ChannelConfig::new("ch").with_max_wait(100);
        assert!(validate_config(&config).is_err());

        let config = ChannelConfig::new("ch").with_debounce(100).with_max_wait(100);
        assert!(validate_config(&config).is_err());

        let config = ChannelConfig::new("ch").with_debounce(100).with_max_wait(300);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn required_policies() {
        assert!(payload_satisfies_required(RequiredPolicy::Off, &Value::Null));
        assert!(!payload_satisfies_required(
            RequiredPolicy::Required,
            &Value::Null
        ));
        assert!(payload_satisfies_required(
            RequiredPolicy::Required,
            &json!(0)
        ));
        assert!(!payload_satisfies_required(
            RequiredPolicy::NonEmpty,
            &json!("")
        ));
        assert!(!payload_satisfies_required(
            RequiredPolicy::NonEmpty,
            &json!([])
        ));
        assert!(!payload_satisfies_required(
            RequiredPolicy::NonEmpty,
            &json!({})
        ));
        assert!(payload_satisfies_required(
            RequiredPolicy::NonEmpty,
            &json!({"k": 1})
        ));
        assert!(payload_satisfies_required(
            RequiredPolicy::NonEmpty,
            &json!(0)
        ));
    }
}
