//! Event Bus & Module Lifecycle substrate (spec §4.A, §5).
//!
//! Modules never call each other directly; they publish and subscribe
//! through [`EventBus`]. Delivery is per-topic FIFO to each subscriber
//! (spec §8 property 1); across topics no ordering is implied. Each
//! subscriber owns a single dispatch task unless it opts into
//! `ordered: false`, in which case dispatch runs on a bounded semaphore
//! instead of serializing through one task.

pub mod topics;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant as TokioInstant;
use tracing::{error, warn};
use uuid::Uuid;

pub use topics::{Payload, Topic};

use crate::models::Classification;

/// Every bus message (spec §3 "Event envelope").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub topic_name: &'static str,
    pub ts: DateTime<Utc>,
    pub correlation_id: String,
    pub producer: String,
    pub payload: Payload,
    pub classification: Classification,
}

impl Envelope {
    pub fn new(topic: Topic, producer: &str, payload: Payload) -> Self {
        Self::with_correlation(topic, producer, payload, Uuid::new_v4().to_string())
    }

    pub fn with_correlation(
        topic: Topic,
        producer: &str,
        payload: Payload,
        correlation_id: String,
    ) -> Self {
        Self {
            topic_name: topic.name(),
            ts: Utc::now(),
            correlation_id,
            producer: producer.to_string(),
            payload,
            classification: Classification::Public,
        }
    }

    pub fn classified(mut self, c: Classification) -> Self {
        self.classification = c;
        self
    }

    /// Derive a follow-on event that keeps this envelope's correlation id
    /// (spec §3: "correlationId is propagated when derived events are
    /// emitted").
    pub fn derive(&self, topic: Topic, producer: &str, payload: Payload) -> Self {
        Self::with_correlation(topic, producer, payload, self.correlation_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    Block,
    DropOldest,
    DropNew,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::DropNew
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Preserve per-(topic,subscriber) FIFO. `false` opts into parallel
    /// dispatch (spec §4.A).
    pub ordered: bool,
    /// Opt into the idempotency LRU cache keyed by `(topic, correlationId)`.
    pub idempotent: bool,
    /// Bounded queue depth (spec default 10_000).
    pub queue_size: usize,
    pub backpressure: BackpressurePolicy,
    /// Concurrency pool size when `ordered == false`.
    pub concurrency: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// TTL for the idempotency cache entries (topic retention memorySec).
    pub idempotency_ttl: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            idempotent: false,
            queue_size: 10_000,
            backpressure: BackpressurePolicy::DropNew,
            concurrency: 1,
            max_retries: 0,
            backoff_ms: 100,
            idempotency_ttl: Duration::from_secs(3600),
        }
    }
}

pub type HandlerResult = Result<(), crate::error::OpsError>;
pub type Handler = Arc<
    dyn Fn(Envelope) -> std::pin::Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send>>
        + Send
        + Sync,
>;

/// LRU set of `(topic, correlationId)` with TTL, scoped to one subscriber
/// (spec §4.A idempotency contract).
struct IdempotencyCache {
    ttl: Duration,
    seen: HashMap<String, Instant2>,
    order: VecDeque<String>,
    cap: usize,
}

/// `std::time::Instant` wrapper kept separate from tokio's so the cache has
/// no async dependency.
type Instant2 = std::time::Instant;

impl IdempotencyCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
            order: VecDeque::new(),
            cap: 100_000,
        }
    }

    /// Returns `true` if this key was already seen (and still within TTL).
    fn check_and_insert(&mut self, key: &str) -> bool {
        let now = Instant2::now();
        if let Some(seen_at) = self.seen.get(key) {
            if now.duration_since(*seen_at) < self.ttl {
                return true;
            }
        }
        self.seen.insert(key.to_string(), now);
        self.order.push_back(key.to_string());
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        false
    }
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<Envelope>,
    opts: SubscribeOptions,
    idempotency: Option<Arc<Mutex<IdempotencyCache>>>,
    duplicates: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<Subscriber>,
}

/// Health/metrics snapshot surfaced by `status` (spec §4.A, §6 CLI).
#[derive(Debug, Clone, serde::Serialize)]
pub struct BusHealth {
    pub topics: HashMap<String, Vec<SubscriberHealth>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriberHealth {
    pub name: String,
    pub duplicates: u64,
    pub dropped: u64,
}

/// Typed pub/sub core (spec §4.A).
pub struct EventBus {
    topics: Mutex<HashMap<&'static str, TopicState>>,
    shutdown: Arc<tokio::sync::Notify>,
    stopped: std::sync::atomic::AtomicBool,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Register a subscriber on `topic`. `handler` runs inside the bus's own
    /// dispatch task(s) for this subscriber; per spec it sees only events on
    /// this one topic, in publish order unless `opts.ordered == false`.
    pub fn subscribe(self: &Arc<Self>, topic: Topic, name: &str, handler: Handler, opts: SubscribeOptions) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(opts.queue_size);
        let idempotency = opts
            .idempotent
            .then(|| Arc::new(Mutex::new(IdempotencyCache::new(opts.idempotency_ttl))));
        let duplicates = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let sub = Subscriber {
            name: name.to_string(),
            tx,
            opts: opts.clone(),
            idempotency: idempotency.clone(),
            duplicates: duplicates.clone(),
            dropped: dropped.clone(),
        };
        self.topics
            .lock()
            .entry(topic.name())
            .or_default()
            .subscribers
            .push(sub);

        let shutdown = self.shutdown.clone();
        let sub_name = name.to_string();
        let concurrency = opts.concurrency.max(1);
        let ordered = opts.ordered;
        let max_retries = opts.max_retries;
        let backoff_ms = opts.backoff_ms;

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(if ordered { 1 } else { concurrency }));
            loop {
                let envelope = tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    maybe = rx.recv() => match maybe {
                        Some(e) => e,
                        None => break,
                    },
                };

                if let Some(cache) = &idempotency {
                    let key = format!("{}::{}", envelope.topic_name, envelope.correlation_id);
                    if cache.lock().check_and_insert(&key) {
                        duplicates.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }

                let handler = handler.clone();
                let permit = semaphore.clone().acquire_owned().await.ok();
                let sub_name2 = sub_name.clone();
                let task = async move {
                    let _permit = permit;
                    let mut attempt = 0u32;
                    loop {
                        match handler(envelope.clone()).await {
                            Ok(()) => break,
                            Err(e) => {
                                tracing::error!(
                                    subscriber = %sub_name2,
                                    code = e.code(),
                                    error = %e,
                                    "handler failed"
                                );
                                if attempt >= max_retries {
                                    break;
                                }
                                attempt += 1;
                                let jitter = rand::random::<u64>() % backoff_ms.max(1);
                                let backoff = backoff_ms.saturating_mul(1 << attempt.min(6)) + jitter;
                                tokio::time::sleep(Duration::from_millis(backoff)).await;
                            }
                        }
                    }
                };

                if ordered {
                    task.await;
                } else {
                    tokio::spawn(task);
                }
            }
        });
    }

    /// Deliver `envelope` to every subscriber of `topic`, applying each
    /// subscriber's own backpressure policy (spec §4.A).
    pub async fn publish(self: &Arc<Self>, topic: Topic, envelope: Envelope) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        // Snapshot sender handles under the lock, then release it before any
        // potentially-suspending send (no lock held across a suspension
        // point, per spec §5 locking discipline).
        let senders: Vec<(String, mpsc::Sender<Envelope>, BackpressurePolicy, Arc<AtomicU64>)> = {
            let topics = self.topics.lock();
            topics
                .get(topic.name())
                .map(|t| {
                    t.subscribers
                        .iter()
                        .map(|s| {
                            (
                                s.name.clone(),
                                s.tx.clone(),
                                s.opts.backpressure,
                                s.dropped.clone(),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        for (name, tx, policy, dropped) in senders {
            match policy {
                BackpressurePolicy::Block => {
                    if tx.send(envelope.clone()).await.is_err() {
                        warn!(subscriber = %name, "subscriber channel closed");
                    }
                }
                BackpressurePolicy::DropNew => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(envelope.clone()) {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(subscriber = %name, topic = topic.name(), "queue full, dropping new event");
                    }
                }
                BackpressurePolicy::DropOldest => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(envelope.clone()) {
                        // Best effort: the channel has no pop-front primitive,
                        // so drop-oldest is approximated by counting the drop
                        // and retrying once after a zero-wait yield.
                        dropped.fetch_add(1, Ordering::Relaxed);
                        tokio::task::yield_now().await;
                        let _ = tx.try_send(envelope.clone());
                    }
                }
            }
        }
    }

    pub fn health_snapshot(&self) -> BusHealth {
        let topics = self.topics.lock();
        let mut out = HashMap::new();
        for (name, state) in topics.iter() {
            out.insert(
                name.to_string(),
                state
                    .subscribers
                    .iter()
                    .map(|s| SubscriberHealth {
                        name: s.name.clone(),
                        duplicates: s.duplicates.load(Ordering::Relaxed),
                        dropped: s.dropped.load(Ordering::Relaxed),
                    })
                    .collect(),
            );
        }
        BusHealth { topics: out }
    }

    /// Stop accepting new publishes, drain for up to `grace`, then signal
    /// every dispatch task to cancel (spec §4.A shutdown contract).
    pub async fn shutdown_all(self: &Arc<Self>, grace: Duration) {
        self.stopped.store(true, Ordering::Relaxed);
        let deadline = TokioInstant::now() + grace;
        tokio::time::sleep_until(deadline).await;
        self.shutdown.notify_waiters();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }
}
