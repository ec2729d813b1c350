//! Response shape returned by every public bus operation
//!
//! Exceptions never escape to callers; every outcome, including pipeline
//! denials and handler failures, is folded into a [`Response`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Repeat;

/// Outcome of a public bus operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Whether the operation succeeded
    pub ok: bool,
    /// Result payload, when the handler produced one
    pub payload: Option<Value>,
    /// Human-readable outcome description
    pub message: String,
    /// Error description for failed operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured outcome details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

/// Structured details attached to a [`Response`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// The call was handed to the scheduler
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<bool>,
    /// Scheduled interval in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Scheduled first-execution delay in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Scheduled repeat specification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<Repeat>,
    /// The call was debounced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed: Option<bool>,
    /// Debounce duration in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Response of the intra-link chain, when the handler linked onward
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_result: Option<Box<Response>>,
    /// Why the pipeline blocked the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    /// Handler execution time in microseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_us: Option<u64>,
    /// The fallback payload was substituted after retries were exhausted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
}

impl Response {
    /// Successful outcome with an optional payload
    pub fn ok(payload: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            ok: true,
            payload,
            message: message.into(),
            error: None,
            metadata: None,
        }
    }

    /// Failed outcome with an error string
    pub fn err(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: None,
            message: message.into(),
            error: Some(error.into()),
            metadata: None,
        }
    }

    /// Pipeline denial with a block reason in the metadata
    pub fn blocked(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            ok: false,
            payload: None,
            message: reason.clone(),
            error: None,
            metadata: Some(ResponseMetadata {
                block_reason: Some(reason),
                ..Default::default()
            }),
        }
    }

    /// Debounce outcome: not an error, the execution is pending
    pub fn delayed(duration_ms: u64) -> Self {
        Self {
            ok: false,
            payload: None,
            message: format!("Debounced - will execute in {duration_ms}ms"),
            error: None,
            metadata: Some(ResponseMetadata {
                delayed: Some(true),
                duration: Some(duration_ms),
                ..Default::default()
            }),
        }
    }

    /// Scheduling outcome: the call was handed to the TimeKeeper
    pub fn scheduled(interval: Option<u64>, delay: Option<u64>, repeat: Repeat) -> Self {
        let described = match repeat {
            Repeat::Times(n) => format!("Scheduled {n} execution(s)"),
            Repeat::Forever => "Scheduled repeating execution".to_string(),
        };
        let detail = match (interval, delay) {
            (Some(i), Some(d)) => format!("{described} every {i}ms after {d}ms"),
            (Some(i), None) => format!("{described} every {i}ms"),
            (None, Some(d)) => format!("{described} after {d}ms"),
            (None, None) => described,
        };
        Self {
            ok: true,
            payload: None,
            message: detail,
            error: None,
            metadata: Some(ResponseMetadata {
                scheduled: Some(true),
                interval,
                delay,
                repeat: Some(repeat),
                ..Default::default()
            }),
        }
    }

    /// Attach or extend metadata
    pub fn with_metadata(mut self, f: impl FnOnce(&mut ResponseMetadata)) -> Self {
        let meta = self.metadata.get_or_insert_with(ResponseMetadata::default);
        f(meta);
        self
    }

    /// Block reason, when the pipeline denied the call
    pub fn block_reason(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.block_reason.as_deref())
    }

    /// Whether this response represents a pending debounced execution
    pub fn is_delayed(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.delayed)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delayed_response_carries_duration() {
        let r = Response::delayed(50);
        assert!(!r.ok);
        assert!(r.is_delayed());
        assert_eq!(r.metadata.as_ref().unwrap().duration, Some(50));
        assert!(r.message.contains("50ms"));
    }

    #[test]
    fn scheduled_response_describes_repeat() {
        let r = Response::scheduled(Some(100), None, Repeat::Times(3));
        assert!(r.ok);
        assert!(r.message.contains("3 execution(s)"));
        let meta = r.metadata.unwrap();
        assert_eq!(meta.scheduled, Some(true));
        assert_eq!(meta.interval, Some(100));
        assert_eq!(meta.repeat, Some(Repeat::Times(3)));
    }

    #[test]
    fn blocked_response_mirrors_reason() {
        let r = Response::blocked("Throttled: 80ms remaining");
        assert!(!r.ok);
        assert_eq!(r.block_reason(), Some("Throttled: 80ms remaining"));
    }

    #[test]
    fn response_serializes_without_empty_fields() {
        let r = Response::ok(Some(json!({"x": 1})), "done");
        let v = serde_json::to_value(&r).unwrap();
        assert!(v.get("error").is_none());
        assert!(v.get("metadata").is_none());
    }
}
