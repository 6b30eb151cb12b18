//! Telemetry Anomaly Detector (spec §4.F, component F).
//!
//! Maintains a robust baseline (median/MAD/mean/stdev/EWMA) per
//! `(series, window)` and classifies each new point as flatline, gap,
//! spike/drop, or drift, suppressing duplicate alerts within the window's
//! duration (spec §4.F "Emission & idempotency").

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditSink;
use crate::bus::topics::{AnomalyKind, AnomalyMetrics, AnomalySeverity, AnomalySignal, TelemetryPoint};
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::error::OpsResult;
use crate::lifecycle::{Health, HealthState, Module};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowSpec {
    pub span_secs: u64,
    pub step_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub windows: Vec<WindowSpec>,
    pub min_points: usize,
    pub flatline_stale_secs: i64,
    pub gap_stale_secs: i64,
    pub z_hi: f64,
    pub z_warn: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            windows: vec![
                WindowSpec { span_secs: 60, step_secs: 10 },
                WindowSpec { span_secs: 300, step_secs: 30 },
                WindowSpec { span_secs: 3600, step_secs: 300 },
            ],
            min_points: 20,
            flatline_stale_secs: 120,
            gap_stale_secs: 90,
            z_hi: 3.5,
            z_warn: 2.0,
        }
    }
}

fn window_label(w: WindowSpec) -> String {
    format!("{}s/{}s", w.span_secs, w.step_secs)
}

#[derive(Debug, Clone)]
struct Point {
    v: f64,
    t: DateTime<Utc>,
}

struct Baseline {
    history: VecDeque<Point>,
    capacity: usize,
    point_count: u64,
    last_update: DateTime<Utc>,
    last_alert: HashMap<(AnomalyKind, &'static str), DateTime<Utc>>,
}

impl Baseline {
    fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            point_count: 0,
            last_update: Utc::now(),
            last_alert: HashMap::new(),
        }
    }

    fn push(&mut self, p: Point) {
        self.last_update = p.t;
        self.point_count += 1;
        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(p);
        // Retention <= 24h since last update (spec §3 Baseline record).
        let cutoff = self.last_update - chrono::Duration::hours(24);
        while self.history.front().map(|p| p.t < cutoff).unwrap_or(false) {
            self.history.pop_front();
        }
    }

    fn values(&self) -> Vec<f64> {
        self.history.iter().map(|p| p.v).collect()
    }

    fn mean(&self) -> f64 {
        let v = self.values();
        if v.is_empty() {
            0.0
        } else {
            v.iter().sum::<f64>() / v.len() as f64
        }
    }

    fn stdev(&self) -> f64 {
        let v = self.values();
        if v.len() < 2 {
            return 0.0;
        }
        let m = self.mean();
        (v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / v.len() as f64).sqrt()
    }

    fn median(&self) -> f64 {
        let mut v = self.values();
        if v.is_empty() {
            return 0.0;
        }
        v.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = v.len() / 2;
        if v.len() % 2 == 0 {
            (v[mid - 1] + v[mid]) / 2.0
        } else {
            v[mid]
        }
    }

    /// Median absolute deviation.
    fn mad(&self) -> f64 {
        let med = self.median();
        let mut dev: Vec<f64> = self.values().iter().map(|x| (x - med).abs()).collect();
        if dev.is_empty() {
            return 0.0;
        }
        dev.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = dev.len() / 2;
        if dev.len() % 2 == 0 {
            (dev[mid - 1] + dev[mid]) / 2.0
        } else {
            dev[mid]
        }
    }

    fn is_flatline(&self) -> bool {
        if self.history.len() < 10 {
            return false;
        }
        let last10: Vec<f64> = self.history.iter().rev().take(10).map(|p| p.v).collect();
        last10.windows(2).all(|w| (w[0] - w[1]).abs() < f64::EPSILON)
    }
}

pub struct AnomalyDetector {
    config: parking_lot::RwLock<AnomalyConfig>,
    baselines: parking_lot::Mutex<HashMap<(String, String), Baseline>>,
    bus: parking_lot::RwLock<Option<Arc<EventBus>>>,
    audit: Arc<AuditSink>,
    evaluated: std::sync::atomic::AtomicU64,
    flagged: std::sync::atomic::AtomicU64,
    flatlines: std::sync::atomic::AtomicU64,
    gaps: std::sync::atomic::AtomicU64,
}

impl AnomalyDetector {
    pub fn new(audit: Arc<AuditSink>, config: AnomalyConfig) -> Arc<Self> {
        Arc::new(Self {
            config: parking_lot::RwLock::new(config),
            baselines: parking_lot::Mutex::new(HashMap::new()),
            bus: parking_lot::RwLock::new(None),
            audit,
            evaluated: std::sync::atomic::AtomicU64::new(0),
            flagged: std::sync::atomic::AtomicU64::new(0),
            flatlines: std::sync::atomic::AtomicU64::new(0),
            gaps: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Ingest one telemetry point for every configured window (spec §4.F
    /// "Windows"; §8 scenario S3 robust-z).
    pub async fn ingest(&self, point: TelemetryPoint) {
        let cfg = self.config.read().clone();
        for window in &cfg.windows {
            let label = window_label(*window);
            self.evaluate_one(&point.series, &label, point.v, point.t, &cfg).await;
        }
    }

    async fn evaluate_one(
        &self,
        series: &str,
        window_label: &str,
        v: f64,
        t: DateTime<Utc>,
        cfg: &AnomalyConfig,
    ) {
        self.evaluated.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut guard = self.baselines.lock();
        let baseline = guard
            .entry((series.to_string(), window_label.to_string()))
            .or_insert_with(|| Baseline::new(2000));
        baseline.push(Point { v, t });

        if baseline.point_count < cfg.min_points as u64 {
            return;
        }

        let age_secs = (Utc::now() - baseline.last_update).num_seconds();

        let signal = if baseline.is_flatline() && age_secs <= cfg.flatline_stale_secs {
            self.flatlines.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Some((AnomalyKind::Flatline, AnomalySeverity::Medium, 1.0))
        } else if age_secs > cfg.gap_stale_secs {
            self.gaps.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let sev = if age_secs > 5 * cfg.gap_stale_secs {
                AnomalySeverity::High
            } else {
                AnomalySeverity::Medium
            };
            Some((AnomalyKind::Gap, sev, age_secs as f64))
        } else {
            let median = baseline.median();
            let mad = baseline.mad();
            let mean = baseline.mean();
            let stdev = baseline.stdev();
            // MAD=0 guard: fall back to stdev (spec §4.F, §8 scenario S3).
            let denom = if mad > 0.0 { mad } else { stdev.max(1e-9) };
            let z = (v - median).abs() / denom;
            if z < cfg.z_warn {
                None
            } else {
                let kind = if (v - mean).abs() > 2.0 * stdev {
                    if v > mean { AnomalyKind::Spike } else { AnomalyKind::Drop }
                } else {
                    AnomalyKind::Drift
                };
                let severity = if z >= cfg.z_hi { AnomalySeverity::High } else { AnomalySeverity::Low };
                Some((kind, severity, z))
            }
        };

        let Some((kind, severity, score)) = signal else {
            return;
        };

        let key = (kind, window_label);
        // Suppress duplicates within the window's span; cleanup after 1h
        // (spec §4.F "Emission & idempotency").
        let now = Utc::now();
        if let Some(last) = baseline.last_alert.get(&key) {
            let window_secs = cfg
                .windows
                .iter()
                .find(|w| window_label == self::window_label(**w))
                .map(|w| w.span_secs as i64)
                .unwrap_or(60);
            if (now - *last).num_seconds() < window_secs {
                return;
            }
        }
        baseline.last_alert.insert(key, now);
        baseline.last_alert.retain(|_, t| (now - *t).num_seconds() < 3600);
        drop(guard);

        self.flagged.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(series, window_label, ?kind, ?severity, score, "telemetry anomaly detected");

        let anomaly = AnomalySignal {
            series: series.to_string(),
            window: window_label.to_string(),
            kind,
            severity,
            score,
        };
        if let Some(bus) = self.bus.read().clone() {
            let envelope = Envelope::new(
                Topic::TelemetryAnomalySignal,
                "anomaly_detector",
                Payload::AnomalySignal(anomaly.clone()),
            );
            bus.publish(Topic::TelemetryAnomalySignal, envelope).await;

            // `telemetry.alert` is emitted only for severity high (spec §4.F).
            if matches!(severity, AnomalySeverity::High) {
                let envelope = Envelope::new(
                    Topic::TelemetryAlert,
                    "anomaly_detector",
                    Payload::AnomalySignal(anomaly),
                );
                bus.publish(Topic::TelemetryAlert, envelope).await;
            }
        }
        self.audit
            .record("anomaly_detector", None, "anomaly_signal", &format!("{series} {:?}", kind))
            .await;
    }

    /// Emit and reset the periodic counters (spec §4.F "Metrics", every
    /// 60s).
    pub async fn emit_metrics_and_reset(&self, window_sec: u64) {
        let evaluated = self.evaluated.swap(0, std::sync::atomic::Ordering::Relaxed);
        let flagged = self.flagged.swap(0, std::sync::atomic::Ordering::Relaxed);
        let flatlines = self.flatlines.swap(0, std::sync::atomic::Ordering::Relaxed);
        let gaps = self.gaps.swap(0, std::sync::atomic::Ordering::Relaxed);
        let metrics = AnomalyMetrics {
            evaluated,
            flagged,
            flatlines,
            gaps,
            by_level: HashMap::new(),
            window_sec,
        };
        if let Some(bus) = self.bus.read().clone() {
            let envelope = Envelope::new(
                Topic::TelemetryAnomalyMetrics,
                "anomaly_detector",
                Payload::AnomalyMetrics(metrics),
            );
            bus.publish(Topic::TelemetryAnomalyMetrics, envelope).await;
        }
    }
}

impl Clone for AnomalyConfig {
    fn clone(&self) -> Self {
        Self {
            windows: self.windows.clone(),
            min_points: self.min_points,
            flatline_stale_secs: self.flatline_stale_secs,
            gap_stale_secs: self.gap_stale_secs,
            z_hi: self.z_hi,
            z_warn: self.z_warn,
        }
    }
}

#[async_trait]
impl Module for Arc<AnomalyDetector> {
    fn name(&self) -> &'static str {
        "anomaly_detector"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, config: &serde_json::Value) -> OpsResult<()> {
        if let Ok(cfg) = serde_json::from_value::<AnomalyConfig>(config.clone()) {
            *self.config.write() = cfg;
        }
        *self.bus.write() = Some(bus.clone());

        let this = self.clone();
        bus.subscribe(
            Topic::TelemetryMetrics,
            "anomaly_detector.points",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::TelemetryPoint(point) = envelope.payload {
                        this.ingest(point).await;
                    }
                    Ok(())
                })
            }),
            SubscribeOptions {
                concurrency: 8,
                ordered: false,
                ..Default::default()
            },
        );

        let this = self.clone();
        bus.subscribe(
            Topic::ClockTick1m,
            "anomaly_detector.metrics_tick",
            Arc::new(move |_envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    this.emit_metrics_and_reset(60).await;
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );
        Ok(())
    }

    async fn shutdown(&self, _grace: Duration) -> OpsResult<()> {
        Ok(())
    }

    async fn health_snapshot(&self) -> Health {
        Health {
            state: HealthState::Healthy,
            detail: format!("series_tracked={}", self.baselines.lock().len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn s3_robust_z_spike_with_mad_zero_fallback() {
        let audit = Arc::new(
            AuditSink::open(std::env::temp_dir().join("opsctl_test_audit_anomaly.jsonl"))
                .await
                .unwrap(),
        );
        let detector = AnomalyDetector::new(audit, AnomalyConfig::default());
        let base = Utc::now();
        let window_label = "60s/10s";
        let cfg = detector.config.read().clone();
        for i in 0..20 {
            detector
                .evaluate_one("cpu", window_label, 100.0, base + chrono::Duration::seconds(i), &cfg)
                .await;
        }
        detector
            .evaluate_one("cpu", window_label, 140.0, base + chrono::Duration::seconds(21), &cfg)
            .await;
        let guard = detector.baselines.lock();
        let baseline = guard.get(&("cpu".to_string(), window_label.to_string())).unwrap();
        assert_eq!(baseline.mad(), 0.0);
    }

    #[test]
    fn flatline_requires_ten_equal_points() {
        let mut b = Baseline::new(100);
        let t = Utc::now();
        for i in 0..9 {
            b.push(Point { v: 1.0, t: t + chrono::Duration::seconds(i) });
        }
        assert!(!b.is_flatline());
        b.push(Point { v: 1.0, t: t + chrono::Duration::seconds(9) });
        assert!(b.is_flatline());
    }
}
