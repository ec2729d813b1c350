//! Intra-link chaining: a handler's `{id, payload}` return calls the
//! named channel before the parent response returns.

use parking_lot::Mutex;
use pulsebus::{Bus, ChannelConfig, HandlerOutcome};
use serde_json::{json, Value};
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn link_calls_target_before_parent_returns() {
    let bus = Bus::new();

    bus.action(ChannelConfig::new("a"));
    bus.action(ChannelConfig::new("b"));

    bus.on("a", |_payload| async {
        Ok(HandlerOutcome::Link {
            id: "b".to_string(),
            payload: json!(42),
        })
    });

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    bus.on("b", move |payload| {
        let seen = seen_clone.clone();
        async move {
            seen.lock().push(payload);
            Ok(HandlerOutcome::Done)
        }
    });

    let response = bus.call("a", Some(json!("start"))).await;
    assert!(response.ok);

    // The chain already ran by the time the parent response is in hand.
    assert_eq!(seen.lock().as_slice(), &[json!(42)]);

    let chain = response
        .metadata
        .as_ref()
        .and_then(|m| m.chain_result.as_ref())
        .unwrap();
    assert!(chain.ok);
    assert_eq!(chain.payload, Some(json!(42)));
}

#[tokio::test(start_paused = true)]
async fn chain_failure_does_not_fail_parent() {
    let bus = Bus::new();
    bus.action(ChannelConfig::new("a"));
    bus.on("a", |_payload| async {
        Ok(HandlerOutcome::Link {
            id: "nowhere".to_string(),
            payload: Value::Null,
        })
    });

    let response = bus.call("a", None).await;
    assert!(response.ok);

    let chain = response
        .metadata
        .as_ref()
        .and_then(|m| m.chain_result.as_ref())
        .unwrap();
    assert!(!chain.ok);
    assert_eq!(chain.error.as_deref(), Some("unknown id"));
}

#[tokio::test(start_paused = true)]
async fn links_chain_transitively() {
    let bus = Bus::new();
    for id in ["a", "b", "c"] {
        bus.action(ChannelConfig::new(id));
    }
    bus.on("a", |_payload| async {
        Ok(HandlerOutcome::Link {
            id: "b".to_string(),
            payload: json!(1),
        })
    });
    bus.on("b", |payload| async move {
        let n = payload.as_i64().unwrap_or(0);
        Ok(HandlerOutcome::Link {
            id: "c".to_string(),
            payload: json!(n + 1),
        })
    });
    bus.on("c", |payload| async move { Ok(HandlerOutcome::Value(payload)) });

    let response = bus.call("a", None).await;
    assert!(response.ok);

    let first = response
        .metadata
        .as_ref()
        .and_then(|m| m.chain_result.as_ref())
        .unwrap();
    let second = first
        .metadata
        .as_ref()
        .and_then(|m| m.chain_result.as_ref())
        .unwrap();
    assert!(second.ok);
    assert_eq!(second.payload, Some(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn value_return_becomes_response_payload() {
    let bus = Bus::new();
    bus.action(ChannelConfig::new("calc"));
    bus.on("calc", |payload| async move {
        let n = payload.as_i64().unwrap_or(0);
        Ok(HandlerOutcome::Value(json!(n * 2)))
    });

    let response = bus.call("calc", Some(json!(21))).await;
    assert!(response.ok);
    assert_eq!(response.payload, Some(json!(42)));
}
