//! TimeKeeper: the centralized quartz scheduler
//!
//! One resumable task drives every delay, interval, repeat, and debounce
//! in the bus, looping at a 10 ms target tick. Formations live in an
//! id-keyed store scanned each tick; due formations fire high-tier-first,
//! with drift compensation for short intervals and chunking for waits
//! beyond the platform cap. The tick halts on hibernation and exits when
//! no formations remain; `keep` restarts it on demand.

mod formation;

pub use formation::{
    Formation, FormationMetrics, FormationStatus, PrecisionTier, TimerCallback,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

use crate::breathing::MetricsState;
use crate::constants::{DRIFT_TOLERANCE_MS, QUARTZ_TICK_MS, RUNAWAY_EXECUTION_CAP};
use crate::error::{BusError, BusResult};
use crate::sensor::{EventKind, Sensor, SensorEvent};
use crate::types::Repeat;

/// Aggregate scheduler counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeKeeperStats {
    /// Formations created over the TimeKeeper's lifetime
    pub formations_created: u64,
    /// Completed callback executions
    pub total_executions: u64,
    /// Callback executions that returned an error
    pub failed_executions: u64,
}

struct TimeKeeperInner {
    formations: RwLock<HashMap<String, Formation>>,
    metrics: Arc<MetricsState>,
    sensor: Arc<Sensor>,
    quartz_running: AtomicBool,
    generation: AtomicU64,
    formations_created: AtomicU64,
    total_executions: AtomicU64,
    failed_executions: AtomicU64,
}

/// Centralized timer engine
#[derive(Clone)]
pub struct TimeKeeper {
    inner: Arc<TimeKeeperInner>,
}

impl TimeKeeper {
    /// New TimeKeeper; quartz starts lazily with the first formation
    pub fn new(metrics: Arc<MetricsState>, sensor: Arc<Sensor>) -> Self {
        Self {
            inner: Arc::new(TimeKeeperInner {
                formations: RwLock::new(HashMap::new()),
                metrics,
                sensor,
                quartz_running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                formations_created: AtomicU64::new(0),
                total_executions: AtomicU64::new(0),
                failed_executions: AtomicU64::new(0),
            }),
        }
    }

    /// Register (or replace) a formation
    ///
    /// `duration_ms` spaces executions after the first; `delay_ms`, when
    /// set, governs only the first. `repeat` is the total execution
    /// count: zero never runs, `Forever` always reschedules. Returns the
    /// formation id.
    pub fn keep(
        &self,
        duration_ms: u64,
        callback: TimerCallback,
        repeat: Repeat,
        id: Option<String>,
        delay_ms: Option<u64>,
    ) -> BusResult<String> {
        if self.inner.metrics.is_hibernating() {
            return Err(BusError::Scheduler(
                "scheduler is hibernating; reset before keeping timers".to_string(),
            ));
        }
        if !repeat.runnable() {
            return Err(BusError::Scheduler(
                "repeat of 0 would never execute".to_string(),
            ));
        }

        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Instant::now();
        let first_wait = delay_ms.unwrap_or(duration_ms);
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let mut formation = Formation {
            id: id.clone(),
            generation,
            start_time: now,
            duration_ms,
            original_duration_ms: duration_ms,
            delay_ms,
            interval_ms: if delay_ms.is_some() {
                Some(duration_ms)
            } else {
                None
            },
            repeat,
            callback,
            next_execution: now,
            last_execution: None,
            has_executed_once: false,
            status: FormationStatus::Active,
            tier: PrecisionTier::for_duration(duration_ms),
            in_recuperation: false,
            chunk_remaining_ms: 0,
            metrics: FormationMetrics::default(),
        };
        formation.schedule_wait(first_wait, now);

        {
            let mut formations = self.inner.formations.write();
            if formations.remove(&id).is_some() {
                tracing::debug!(formation = %id, "replacing existing formation");
            }
            formations.insert(id.clone(), formation);
        }
        self.inner.formations_created.fetch_add(1, Ordering::Relaxed);
        self.start_quartz_if_idle();
        Ok(id)
    }

    /// Single-shot convenience: resolves after `ms` milliseconds
    pub async fn wait(&self, ms: u64, id: Option<String>) -> BusResult<()> {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let callback: TimerCallback = Arc::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
                Ok(())
            })
        });
        self.keep(ms, callback, Repeat::Times(1), id, None)?;
        rx.await
            .map_err(|_| BusError::Scheduler("wait timer was cancelled".to_string()))
    }

    /// Cancel and remove a formation
    pub fn forget(&self, id: &str) -> bool {
        let removed = self.inner.formations.write().remove(id).is_some();
        if removed {
            tracing::debug!(formation = %id, "formation forgotten");
        }
        removed
    }

    /// Pause one formation, or all when `id` is `None`
    pub fn pause(&self, id: Option<&str>) -> usize {
        if self.inner.metrics.is_hibernating() {
            return 0;
        }
        let mut formations = self.inner.formations.write();
        match id {
            Some(id) => match formations.get_mut(id) {
                Some(f) => {
                    f.status = FormationStatus::Paused;
                    1
                }
                None => 0,
            },
            None => {
                let mut count = 0;
                for f in formations.values_mut() {
                    f.status = FormationStatus::Paused;
                    count += 1;
                }
                count
            }
        }
    }

    /// Resume one formation, or all; rescheduled from now
    pub fn resume(&self, id: Option<&str>) -> usize {
        if self.inner.metrics.is_hibernating() {
            return 0;
        }
        let now = Instant::now();
        let resumed = {
            let mut formations = self.inner.formations.write();
            let mut count = 0;
            let mut resume_one = |f: &mut Formation| {
                if f.status == FormationStatus::Paused {
                    f.status = FormationStatus::Active;
                    let wait = f.duration_ms;
                    f.schedule_wait(wait, now);
                }
            };
            match id {
                Some(id) => {
                    if let Some(f) = formations.get_mut(id) {
                        resume_one(f);
                        count = 1;
                    }
                }
                None => {
                    for f in formations.values_mut() {
                        resume_one(f);
                        count += 1;
                    }
                }
            }
            count
        };
        if resumed > 0 {
            self.start_quartz_if_idle();
        }
        resumed
    }

    /// Stop the quartz tick, clear every formation, and flag hibernation
    ///
    /// Mutually exclusive with `resume`; only `reset` leaves hibernation.
    pub fn hibernate(&self) {
        self.inner.quartz_running.store(false, Ordering::Release);
        self.inner.formations.write().clear();
        self.inner.metrics.set_hibernating(true);
        self.inner
            .sensor
            .record(SensorEvent::new(EventKind::System, "timekeeper").at("hibernate"));
        tracing::info!("timekeeper hibernating, all formations cleared");
    }

    /// Stop quartz, clear formations and counters, and leave hibernation
    pub fn reset(&self) {
        self.inner.quartz_running.store(false, Ordering::Release);
        self.inner.formations.write().clear();
        self.inner.formations_created.store(0, Ordering::Relaxed);
        self.inner.total_executions.store(0, Ordering::Relaxed);
        self.inner.failed_executions.store(0, Ordering::Relaxed);
        self.inner.metrics.set_hibernating(false);
        self.inner
            .sensor
            .record(SensorEvent::new(EventKind::System, "timekeeper").at("reset"));
    }

    /// Whether a formation exists
    pub fn has_formation(&self, id: &str) -> bool {
        self.inner.formations.read().contains_key(id)
    }

    /// Number of formations, any status
    pub fn formation_count(&self) -> usize {
        self.inner.formations.read().len()
    }

    /// Number of active formations
    pub fn active_formation_count(&self) -> usize {
        self.inner
            .formations
            .read()
            .values()
            .filter(|f| f.status == FormationStatus::Active)
            .count()
    }

    /// Snapshot of scheduler counters
    pub fn stats(&self) -> TimeKeeperStats {
        TimeKeeperStats {
            formations_created: self.inner.formations_created.load(Ordering::Relaxed),
            total_executions: self.inner.total_executions.load(Ordering::Relaxed),
            failed_executions: self.inner.failed_executions.load(Ordering::Relaxed),
        }
    }

    fn start_quartz_if_idle(&self) {
        if self
            .inner
            .quartz_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                Self::quartz_loop(inner).await;
            });
        }
    }

    async fn quartz_loop(inner: Arc<TimeKeeperInner>) {
        tracing::debug!("quartz started");
        let tick = Duration::from_millis(QUARTZ_TICK_MS);
        let mut last_tick = Instant::now();

        loop {
            sleep(tick).await;

            if !inner.quartz_running.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();
            let lag_ms = now
                .duration_since(last_tick)
                .as_millis()
                .saturating_sub(QUARTZ_TICK_MS as u128) as u64;
            inner.metrics.observe_event_loop_lag(lag_ms);
            last_tick = now;

            let mut due: Vec<(String, u64, PrecisionTier)> = {
                let formations = inner.formations.read();
                if formations.is_empty() {
                    drop(formations);
                    inner.quartz_running.store(false, Ordering::Release);
                    // A keep() racing this shutdown may have just inserted.
                    if !inner.formations.read().is_empty()
                        && inner
                            .quartz_running
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        continue;
                    }
                    tracing::debug!("quartz idle, stopping");
                    return;
                }
                formations
                    .values()
                    .filter(|f| f.is_due(now))
                    .map(|f| (f.id.clone(), f.generation, f.tier))
                    .collect()
            };
            due.sort_by_key(|(_, _, tier)| *tier);

            for (id, generation, _) in due {
                Self::fire(&inner, &id, generation).await;
            }
        }
        tracing::debug!("quartz stopped");
    }

    /// Fire one due formation, honoring forget/replace races via generation
    async fn fire(inner: &Arc<TimeKeeperInner>, id: &str, generation: u64) {
        let now = Instant::now();
        let callback = {
            let mut formations = inner.formations.write();
            let formation = match formations.get_mut(id) {
                Some(f) if f.generation == generation && f.status == FormationStatus::Active => f,
                _ => return,
            };

            // A chunked long wait advances to its next chunk without executing.
            if formation.in_recuperation {
                let remaining = formation.chunk_remaining_ms;
                formation.schedule_wait(remaining, now);
                return;
            }

            formation.metrics.last_drift_ms =
                now.duration_since(formation.next_execution).as_millis() as i64;
            formation.callback.clone()
        };

        let started = Instant::now();
        let result = callback().await;
        let elapsed_us = started.elapsed().as_micros() as u64;

        inner.total_executions.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            inner.failed_executions.fetch_add(1, Ordering::Relaxed);
        }

        let mut formations = inner.formations.write();
        let formation = match formations.get_mut(id) {
            // Forgotten or replaced while the callback ran: nothing to update.
            Some(f) if f.generation == generation => f,
            _ => return,
        };

        formation.metrics.executions += 1;
        formation.metrics.total_execution_us += elapsed_us;
        formation.has_executed_once = true;
        formation.last_execution = Some(now);

        if let Err(err) = result {
            formation.metrics.failed_executions += 1;
            inner.sensor.record(
                SensorEvent::new(EventKind::Error, id)
                    .at("timekeeper")
                    .with_metadata(serde_json::json!({ "error": err.to_string() })),
            );
            tracing::warn!(formation = %id, error = %err, "formation callback failed");
        }

        if formation.metrics.executions > RUNAWAY_EXECUTION_CAP {
            inner.sensor.record(
                SensorEvent::new(EventKind::Critical, id)
                    .at("timekeeper")
                    .with_metadata(serde_json::json!({
                        "reason": "runaway formation removed",
                        "executions": formation.metrics.executions,
                    })),
            );
            tracing::error!(formation = %id, "runaway formation removed");
            formations.remove(id);
            return;
        }

        match formation.repeat.decrement() {
            None => {
                formations.remove(id);
            }
            Some(remaining) => {
                formation.repeat = remaining;
                let base = formation.interval_ms.unwrap_or(formation.duration_ms);
                let drift = formation.metrics.last_drift_ms;
                let next_wait = if formation.tier == PrecisionTier::High
                    && drift.unsigned_abs() > DRIFT_TOLERANCE_MS
                {
                    (base as i64 - drift).max(1) as u64
                } else {
                    let stress = inner.metrics.combined_stress();
                    (base as f64 * (1.0 + stress * 0.1)) as u64
                };
                formation.schedule_wait(next_wait, Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn timekeeper() -> TimeKeeper {
        TimeKeeper::new(Arc::new(MetricsState::new()), Arc::new(Sensor::new()))
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> TimerCallback {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn single_shot_fires_once_and_is_removed() {
        let tk = timekeeper();
        let count = Arc::new(AtomicUsize::new(0));
        tk.keep(
            50,
            counting_callback(count.clone()),
            Repeat::Times(1),
            Some("once".into()),
            None,
        )
        .unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!tk.has_formation("once"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_runs_exact_count() {
        let tk = timekeeper();
        let count = Arc::new(AtomicUsize::new(0));
        tk.keep(
            100,
            counting_callback(count.clone()),
            Repeat::Times(3),
            Some("thrice".into()),
            None,
        )
        .unwrap();

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!tk.has_formation("thrice"));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_governs_first_execution_only() {
        let tk = timekeeper();
        let count = Arc::new(AtomicUsize::new(0));
        tk.keep(
            100,
            counting_callback(count.clone()),
            Repeat::Times(2),
            Some("delayed".into()),
            Some(300),
        )
        .unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_cancels_pending_execution() {
        let tk = timekeeper();
        let count = Arc::new(AtomicUsize::new(0));
        tk.keep(
            100,
            counting_callback(count.clone()),
            Repeat::Times(1),
            Some("gone".into()),
            None,
        )
        .unwrap();

        assert!(tk.forget("gone"));
        sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replace_resets_schedule() {
        let tk = timekeeper();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        tk.keep(
            100,
            counting_callback(first.clone()),
            Repeat::Times(1),
            Some("same".into()),
            None,
        )
        .unwrap();
        tk.keep(
            100,
            counting_callback(second.clone()),
            Repeat::Times(1),
            Some("same".into()),
            None,
        )
        .unwrap();

        sleep(Duration::from_millis(300)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume() {
        let tk = timekeeper();
        let count = Arc::new(AtomicUsize::new(0));
        tk.keep(
            100,
            counting_callback(count.clone()),
            Repeat::Forever,
            Some("beat".into()),
            None,
        )
        .unwrap();

        sleep(Duration::from_millis(250)).await;
        let before = count.load(Ordering::SeqCst);
        assert!(before >= 2);

        assert_eq!(tk.pause(Some("beat")), 1);
        sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), before);

        assert_eq!(tk.resume(Some("beat")), 1);
        sleep(Duration::from_millis(250)).await;
        assert!(count.load(Ordering::SeqCst) > before);
    }

    #[tokio::test(start_paused = true)]
    async fn hibernate_clears_and_blocks_keep() {
        let tk = timekeeper();
        let count = Arc::new(AtomicUsize::new(0));
        tk.keep(
            100,
            counting_callback(count.clone()),
            Repeat::Forever,
            Some("beat".into()),
            None,
        )
        .unwrap();

        tk.hibernate();
        assert_eq!(tk.formation_count(), 0);
        assert!(tk
            .keep(
                100,
                counting_callback(count.clone()),
                Repeat::Times(1),
                None,
                None
            )
            .is_err());
        sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tk.reset();
        tk.keep(
            50,
            counting_callback(count.clone()),
            Repeat::Times(1),
            None,
            None,
        )
        .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_resolves_after_duration() {
        let tk = timekeeper();
        let started = Instant::now();
        tk.wait(120, None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test(start_paused = true)]
    async fn callback_error_does_not_stop_repeat() {
        let tk = timekeeper();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let callback: TimerCallback = Arc::new(move || {
            let count = count_clone.clone();
            Box::pin(async move {
                let n = count.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(BusError::Handler("first firing fails".into()))
                } else {
                    Ok(())
                }
            })
        });
        tk.keep(100, callback, Repeat::Times(3), Some("flaky".into()), None)
            .unwrap();

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(tk.stats().failed_executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_zero_is_rejected() {
        let tk = timekeeper();
        let count = Arc::new(AtomicUsize::new(0));
        assert!(tk
            .keep(
                100,
                counting_callback(count.clone()),
                Repeat::Times(0),
                None,
                None
            )
            .is_err());
    }
}
