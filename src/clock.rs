//! Clock & Scheduler (spec §2 component C, §5 "central clock service").
//!
//! Emits `clock.tick1m` and arbitrary jittered periodic ticks. Using a
//! central scheduler (rather than each component owning its own timers)
//! lets tests swap in a virtual clock and keeps jitter policy in one place
//! (spec Design Notes: "timers are submitted to a central scheduler to ease
//! testing").

use std::sync::Arc;
use std::time::Duration;

use quanta::Clock as MonotonicClock;
use rand::Rng;
use tracing::info;

use crate::bus::{Envelope, EventBus, Payload, Topic};

/// Wraps `quanta` for a monotonic `now()` independent of wall-clock
/// adjustments (spec §3: "`ts` is monotonic-source-derived").
#[derive(Clone)]
pub struct Clock {
    inner: MonotonicClock,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            inner: MonotonicClock::new(),
        }
    }

    pub fn now_utc(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }

    pub fn monotonic_now(&self) -> quanta::Instant {
        self.inner.now()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Adds `U(0, jitter_ms)` to a base interval to avoid thundering herds
/// across periodic tasks (spec §4.H probes, §5).
pub fn jittered(base: Duration, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0..=jitter_ms);
    base + Duration::from_millis(extra)
}

pub struct Scheduler {
    bus: Arc<EventBus>,
    clock: Clock,
    shutdown: Arc<tokio::sync::Notify>,
}

impl Scheduler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            clock: Clock::new(),
            shutdown: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    /// Start emitting `clock.tick1m` on a 60s cadence (jittered by up to
    /// one second so subscribers across components don't wake in lockstep).
    pub fn start_tick_1m(&self) {
        let bus = self.bus.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let wait = jittered(Duration::from_secs(60), 1_000);
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let now = chrono::Utc::now();
                let envelope = Envelope::new(Topic::ClockTick1m, "clock", Payload::ClockTick(now));
                bus.publish(Topic::ClockTick1m, envelope).await;
            }
        });
        info!("clock scheduler started: tick1m");
    }

    /// Run `task` on `interval` with per-iteration jitter, honoring
    /// shutdown. Used by components that need a custom cadence (probe
    /// intervals, batch flush, dialog timeout) without hand-rolling a loop.
    pub fn every<F, Fut>(&self, interval: Duration, jitter_ms: u64, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let wait = jittered(interval, jitter_ms);
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                task().await;
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}
