//! Execution policy: per-call timeouts, retries with backoff, and
//! fallback payloads.

use pulsebus::{Bus, BusError, ChannelConfig, HandlerOutcome, PriorityConfig, PriorityLevel};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::test(start_paused = true)]
async fn timeout_discards_result_without_stopping_handler() {
    let bus = Bus::new();
    bus.action(
        ChannelConfig::new("slow").with_priority(
            PriorityConfig::level(PriorityLevel::Medium).with_timeout_ms(50),
        ),
    );

    let finished = Arc::new(AtomicBool::new(false));
    let finished_clone = finished.clone();
    bus.on("slow", move |_payload| {
        let finished = finished_clone.clone();
        async move {
            sleep(Duration::from_millis(500)).await;
            finished.store(true, Ordering::SeqCst);
            Ok(HandlerOutcome::Done)
        }
    });

    let response = bus.call("slow", None).await;
    assert!(!response.ok);
    assert!(response
        .error
        .as_deref()
        .unwrap_or("")
        .contains("timed out"));

    // The spawned handler keeps running past the deadline; only its
    // result was discarded.
    sleep(Duration::from_millis(600)).await;
    assert!(finished.load(Ordering::SeqCst));

    let timeouts = bus.export_events(
        &pulsebus::EventFilter::kind(pulsebus::EventKind::Timeout),
        10,
        0,
    );
    assert_eq!(timeouts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_reinvoke_until_success() {
    let bus = Bus::new();
    bus.action(
        ChannelConfig::new("flaky").with_priority(
            PriorityConfig::level(PriorityLevel::High).with_max_retries(3),
        ),
    );

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    bus.on("flaky", move |_payload| {
        let attempts = attempts_clone.clone();
        async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(BusError::Handler("transient".to_string()))
            } else {
                Ok(HandlerOutcome::Value(json!("recovered")))
            }
        }
    });

    let response = bus.call("flaky", None).await;
    assert!(response.ok);
    assert_eq!(response.payload, Some(json!("recovered")));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fall_back_to_static_payload() {
    let bus = Bus::new();
    bus.action(
        ChannelConfig::new("doomed").with_priority(
            PriorityConfig::level(PriorityLevel::Medium)
                .with_max_retries(2)
                .with_fallback(json!({"mode": "safe"})),
        ),
    );

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    bus.on("doomed", move |_payload| {
        let attempts = attempts_clone.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(BusError::Handler("permanently broken".to_string()))
        }
    });

    let response = bus.call("doomed", None).await;
    assert!(response.ok);
    assert_eq!(response.payload, Some(json!({"mode": "safe"})));
    assert_eq!(
        response.metadata.as_ref().and_then(|m| m.fallback),
        Some(true)
    );
    // Initial attempt plus two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn failure_without_fallback_reports_error() {
    let bus = Bus::new();
    bus.action(
        ChannelConfig::new("plain").with_priority(
            PriorityConfig::level(PriorityLevel::Medium).with_max_retries(1),
        ),
    );

    bus.on("plain", |_payload| async {
        Err(BusError::Handler("broken".to_string()))
    });

    let response = bus.call("plain", None).await;
    assert!(!response.ok);
    assert!(response.error.as_deref().unwrap_or("").contains("broken"));
}
