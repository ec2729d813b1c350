//! Call path: gate, pipeline, scheduling hand-off, and dispatch
//!
//! `call` walks the numbered path: gate flags, channel/handler
//! resolution, the compiled protection pipeline, then either a scheduling
//! hand-off to the TimeKeeper or a direct dispatch. Handler policy
//! (timeout, retries, fallback) and intra-link chaining live in the
//! dispatch half.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

use crate::channel::Channel;
use crate::constants::{RETRY_BACKOFF_MULTIPLIER, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS};
use crate::error::{BusError, BusResult};
use crate::pipeline::{run_step, StepOutcome};
use crate::response::Response;
use crate::sensor::{EventKind, SensorEvent};
use crate::timekeeper::TimerCallback;
use crate::types::{HandlerOutcome, PriorityConfig, PriorityLevel, Repeat};

use super::Bus;

impl Bus {
    /// Invoke a channel with an optional payload
    ///
    /// Never panics and never propagates handler errors as Rust errors:
    /// every outcome is a [`Response`].
    pub fn call<'a>(&'a self, id: &'a str, payload: Option<Value>) -> BoxFuture<'a, Response> {
        Box::pin(self.call_inner(id, payload))
    }

    async fn call_inner(&self, id: &str, payload: Option<Value>) -> Response {
        let payload = payload.unwrap_or(Value::Null);

        let flags = self.inner.metrics.flags();
        if !flags.can_call {
            return Response::err("Call refused", flags.reasons.join("; "));
        }

        let Some(channel) = self.inner.stores.channel(id) else {
            return Response::err(format!("Channel {id} not found"), "unknown id");
        };
        if self.inner.stores.handler(id).is_none() {
            return Response::err(format!("No subscriber for channel {id}"), "no subscriber");
        }

        self.inner.sensor.record(
            SensorEvent::new(EventKind::Call, id)
                .at("runtime")
                .with_priority(channel.priority_level())
                .with_metadata(serde_json::json!({ "has_payload": !payload.is_null() })),
        );

        if channel.is_blocked {
            let reason = channel
                .block_reason
                .clone()
                .unwrap_or_else(|| "blocked".to_string());
            self.record_block(id, "registration", &reason);
            return Response::blocked(reason);
        }

        // Channels without a compiled pipeline still honor recuperation.
        if channel.pipeline.is_empty()
            && self.inner.metrics.is_recuperating()
            && channel.priority_level() != PriorityLevel::Critical
        {
            let reason = "System recuperating - only critical channels accepted";
            self.record_block(id, "recuperation", reason);
            return Response::blocked(reason);
        }

        if channel.has_fast_path {
            return self.finish_call(&channel, payload, "call").await;
        }

        if channel.has_change_detection && !self.inner.payloads.has_changed(id, &payload) {
            self.inner
                .sensor
                .record(SensorEvent::new(EventKind::Skip, id).at("change-detection"));
            return Response::blocked("Payload unchanged — execution skipped");
        }

        let mut payload = payload;
        for (index, step) in channel.pipeline.iter().enumerate() {
            match run_step(step, &channel, &payload, &self.inner.metrics) {
                StepOutcome::Continue => {}
                StepOutcome::ContinueWith(replacement) => payload = replacement,
                StepOutcome::Block(reason) => {
                    self.record_block(id, step.tag(), &reason);
                    return Response::blocked(reason);
                }
                StepOutcome::Delayed { duration_ms } => {
                    return self.schedule_debounce(&channel, index, payload, duration_ms);
                }
            }
        }

        self.finish_call(&channel, payload, "call").await
    }

    fn record_block(&self, id: &str, step_tag: &str, reason: &str) {
        let kind = match step_tag {
            "throttle" => EventKind::Throttle,
            "debounce" => EventKind::Debounce,
            _ => EventKind::Blocked,
        };
        self.inner.sensor.record(
            SensorEvent::new(kind, id)
                .at("pipeline")
                .with_metadata(serde_json::json!({ "step": step_tag, "reason": reason })),
        );
    }

    /// Place (or replace) the channel's debounce timer
    ///
    /// Any previously pending timer for the channel is superseded; when
    /// the timer fires, the pipeline resumes past the debounce step with
    /// the last captured payload. `max_wait` caps total collapse time
    /// from the first coalesced call.
    fn schedule_debounce(
        &self,
        channel: &Arc<Channel>,
        step_index: usize,
        payload: Value,
        duration_ms: u64,
    ) -> Response {
        let timer_id = channel.debounce_timer_id();
        let now = Instant::now();

        let effective_ms = {
            let mut debounce = channel.debounce.lock();
            let first = *debounce.first_queued.get_or_insert(now);
            debounce.timer_id = Some(timer_id.clone());
            match channel.config.max_wait {
                Some(max_wait) => {
                    let elapsed = now.duration_since(first).as_millis() as u64;
                    duration_ms.min(max_wait.saturating_sub(elapsed)).max(1)
                }
                None => duration_ms,
            }
        };

        let bus = self.clone();
        let channel_id = channel.config.id.clone();
        let resume_index = step_index + 1;
        let callback: TimerCallback = Arc::new(move || {
            let bus = bus.clone();
            let channel_id = channel_id.clone();
            let payload = payload.clone();
            Box::pin(async move {
                bus.resume_after_debounce(&channel_id, resume_index, payload)
                    .await;
                Ok(())
            })
        });

        match self.inner.timekeeper.keep(
            effective_ms,
            callback,
            Repeat::Times(1),
            Some(timer_id),
            None,
        ) {
            Ok(_) => {
                self.inner.sensor.record(
                    SensorEvent::new(EventKind::Debounce, &channel.config.id)
                        .at("pipeline")
                        .with_metadata(serde_json::json!({ "duration_ms": effective_ms })),
                );
                Response::delayed(effective_ms)
            }
            Err(err) => Response::err("Failed to schedule debounce", err.to_string()),
        }
    }

    /// Debounce timer fired: resume the pipeline past the debounce step
    pub(crate) async fn resume_after_debounce(
        &self,
        id: &str,
        resume_index: usize,
        payload: Value,
    ) {
        // The channel may have been forgotten while the timer was pending.
        let Some(channel) = self.inner.stores.channel(id) else {
            return;
        };
        {
            let mut debounce = channel.debounce.lock();
            debounce.timer_id = None;
            debounce.first_queued = None;
        }

        let mut payload = payload;
        for step in channel.pipeline.iter().skip(resume_index) {
            match run_step(step, &channel, &payload, &self.inner.metrics) {
                StepOutcome::Continue => {}
                StepOutcome::ContinueWith(replacement) => payload = replacement,
                StepOutcome::Block(reason) => {
                    self.record_block(id, step.tag(), &reason);
                    return;
                }
                // A second debounce step cannot occur; treat it as settled.
                StepOutcome::Delayed { .. } => break,
            }
        }

        let _ = self.finish_call(&channel, payload, "debounce").await;
    }

    /// After the pipeline: hand off to the scheduler or dispatch directly
    pub(crate) async fn finish_call(
        &self,
        channel: &Arc<Channel>,
        payload: Value,
        origin: &str,
    ) -> Response {
        if origin != "schedule" {
            if let Some(schedule) = channel.schedule {
                let duration_ms = schedule
                    .interval_ms
                    .or(schedule.delay_ms)
                    .unwrap_or_default();
                let bus = self.clone();
                let channel_id = channel.config.id.clone();
                let scheduled_payload = payload.clone();
                let callback: TimerCallback = Arc::new(move || {
                    let bus = bus.clone();
                    let channel_id = channel_id.clone();
                    let payload = scheduled_payload.clone();
                    Box::pin(async move { bus.dispatch_scheduled(&channel_id, payload).await })
                });

                return match self.inner.timekeeper.keep(
                    duration_ms,
                    callback,
                    schedule.repeat,
                    Some(channel.config.id.clone()),
                    schedule.delay_ms,
                ) {
                    Ok(_) => Response::scheduled(
                        schedule.interval_ms,
                        schedule.delay_ms,
                        schedule.repeat,
                    ),
                    Err(err) => Response::err("Failed to schedule execution", err.to_string()),
                };
            }
        }

        self.dispatch(channel, payload, origin).await
    }

    /// Scheduler-driven execution for a channel formation
    pub(crate) async fn dispatch_scheduled(&self, id: &str, payload: Value) -> BusResult<()> {
        let Some(channel) = self.inner.stores.channel(id) else {
            return Ok(());
        };
        let response = self.dispatch(&channel, payload, "schedule").await;
        match response.error {
            Some(error) => Err(BusError::Handler(error)),
            None => Ok(()),
        }
    }

    /// Invoke the handler, record metrics, and chain intra-links
    async fn dispatch(&self, channel: &Arc<Channel>, payload: Value, origin: &str) -> Response {
        let id = channel.config.id.clone();
        let Some(handler) = self.inner.stores.handler(&id) else {
            return Response::err(format!("No subscriber for channel {id}"), "no subscriber");
        };

        self.inner
            .sensor
            .record(SensorEvent::new(EventKind::Dispatch, &id).at("runtime"));

        let priority = channel.config.priority.clone().unwrap_or_default();
        let started = Instant::now();
        let result = self
            .execute_with_policy(&id, &priority, &handler, payload.clone())
            .await;
        let elapsed_us = started.elapsed().as_micros() as u64;

        match result {
            Ok(outcome) => {
                // A channel forgotten mid-flight gets no state updates.
                if self.inner.stores.has_channel(&id) {
                    channel.stats.record_execution(Instant::now(), elapsed_us);
                    self.inner.payloads.set(&id, payload.clone(), origin);
                }
                self.inner.sensor.record(
                    SensorEvent::new(EventKind::Execution, &id)
                        .at("runtime")
                        .with_metadata(serde_json::json!({
                            "duration_us": elapsed_us,
                            "origin": origin,
                        })),
                );

                if channel.config.log {
                    tracing::info!(channel = %id, duration_us = elapsed_us, origin, "executed");
                }

                let result_payload = outcome.value().cloned().unwrap_or(payload);
                let mut response = Response::ok(Some(result_payload), "Executed")
                    .with_metadata(|m| m.execution_time_us = Some(elapsed_us));

                if let HandlerOutcome::Link {
                    id: link_id,
                    payload: link_payload,
                } = outcome
                {
                    self.inner.sensor.record(
                        SensorEvent::new(EventKind::Intralink, &id)
                            .at("runtime")
                            .with_metadata(serde_json::json!({ "target": link_id })),
                    );
                    // Boxed to break the call -> dispatch -> call type cycle.
                    let chain = self.call(&link_id, Some(link_payload)).boxed().await;
                    if !chain.ok {
                        tracing::warn!(channel = %id, target = %link_id, "intra-link call failed");
                    }
                    response = response.with_metadata(|m| m.chain_result = Some(Box::new(chain)));
                }
                response
            }
            Err(err) => {
                channel.stats.record_error();
                let kind = match &err {
                    BusError::Timeout(_) => EventKind::Timeout,
                    _ => EventKind::Error,
                };
                self.inner.sensor.record(
                    SensorEvent::new(kind, &id)
                        .at("runtime")
                        .with_metadata(serde_json::json!({ "error": err.to_string() })),
                );

                if let Some(fallback) = &priority.fallback {
                    return Response::ok(
                        Some(fallback.clone()),
                        "Fallback applied after handler failure",
                    )
                    .with_metadata(|m| m.fallback = Some(true));
                }
                Response::err("Handler execution failed", err.to_string())
            }
        }
    }

    /// Run the handler under the channel's execution policy
    ///
    /// A configured timeout races the handler as a spawned task: the
    /// future keeps running past the deadline, its result is simply
    /// discarded. Retries back off exponentially between attempts.
    async fn execute_with_policy(
        &self,
        id: &str,
        priority: &PriorityConfig,
        handler: &crate::types::Handler,
        payload: Value,
    ) -> BusResult<HandlerOutcome> {
        let base_delay = priority.base_delay_ms.unwrap_or(RETRY_BASE_DELAY_MS);
        let max_delay = priority.max_delay_ms.unwrap_or(RETRY_MAX_DELAY_MS);
        let mut backoff = base_delay;
        let mut last_error = None;

        for attempt in 0..=priority.max_retries {
            let future = handler(payload.clone());
            let result = match priority.timeout_ms {
                Some(timeout_ms) => {
                    let handle = tokio::spawn(future);
                    match tokio::time::timeout(Duration::from_millis(timeout_ms), handle).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_err)) => {
                            Err(BusError::Handler(format!("handler task failed: {join_err}")))
                        }
                        Err(_) => Err(BusError::Timeout(timeout_ms)),
                    }
                }
                None => future.await,
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if attempt < priority.max_retries {
                        tracing::warn!(
                            channel = %id,
                            attempt,
                            error = %err,
                            "handler attempt failed, retrying"
                        );
                        sleep(Duration::from_millis(backoff)).await;
                        backoff =
                            ((backoff as f64 * RETRY_BACKOFF_MULTIPLIER) as u64).min(max_delay);
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BusError::Internal("handler produced no result".to_string())))
    }
}

// Pipeline steps and dispatch are exercised end-to-end from tests/; the
// unit tests here cover the pure pieces of the call path.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;

    #[tokio::test]
    async fn unknown_channel_yields_error_response() {
        let bus = Bus::new();
        let response = bus.call("missing", None).await;
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("unknown id"));
    }

    #[tokio::test]
    async fn channel_without_subscriber_is_reported() {
        let bus = Bus::new();
        bus.action(ChannelConfig::new("silent"));
        let response = bus.call("silent", None).await;
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("no subscriber"));
    }

    #[tokio::test]
    async fn fast_path_dispatches_and_echoes_payload() {
        let bus = Bus::new();
        bus.action(ChannelConfig::new("fast"));
        bus.on("fast", |_payload| async { Ok(HandlerOutcome::Done) });

        let response = bus
            .call("fast", Some(serde_json::json!({"n": 1})))
            .await;
        assert!(response.ok);
        assert_eq!(response.payload, Some(serde_json::json!({"n": 1})));
        assert!(response
            .metadata
            .as_ref()
            .and_then(|m| m.execution_time_us)
            .is_some());
    }

    #[tokio::test]
    async fn handler_error_becomes_response() {
        let bus = Bus::new();
        bus.action(ChannelConfig::new("failing"));
        bus.on("failing", |_payload| async {
            Err(BusError::Handler("nope".to_string()))
        });

        let response = bus.call("failing", None).await;
        assert!(!response.ok);
        assert!(response.error.as_deref().unwrap_or("").contains("nope"));
    }
}
